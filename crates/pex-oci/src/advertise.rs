//! The advertisement loop.
//!
//! One long-running task keeps the routing overlay aware of everything
//! this node can serve: image references in the local store (and all of
//! their constituent digests), and file chunks that landed in the chunk
//! cache. Records expire after [`pex_routing::MAX_RECORD_AGE`], so a
//! refresh tick republishes the full set one minute before that.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use pex_routing::{ContentRouter, MAX_RECORD_AGE};

use crate::reference::Reference;
use crate::store::OciStore;

/// Runs until `cancel` fires. Multiplexes the refresh ticker, the
/// store's reference events, and the cached-chunk-key channel.
pub async fn advertise(
    router: Arc<dyn ContentRouter>,
    store: Arc<dyn OciStore>,
    mut chunks: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    debug!("advertising start");
    let mut events = store.subscribe();

    // First tick fires immediately.
    let mut refresh = tokio::time::interval(MAX_RECORD_AGE - Duration::from_secs(60));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = refresh.tick() => {
                info!("scheduled advertisement");
                if let Err(err) = provide_all(router.as_ref(), store.as_ref()).await {
                    error!(%err, "scheduled advertisement failed");
                }
            }

            Some(reference) = events.references.recv() => {
                debug!(image = %reference, digest = %reference.digest(), "advertising image");
                if let Err(err) = provide_reference(router.as_ref(), store.as_ref(), &reference).await {
                    error!(%err, image = %reference, "image advertisement failed");
                }
            }

            Some(key) = chunks.recv() => {
                debug!(chunk = %key, "advertising file chunk");
                if let Err(err) = router.provide(vec![key.clone()]).await {
                    error!(%err, chunk = %key, "chunk advertisement failed");
                }
            }

            Some(err) = events.errors.recv() => {
                error!(%err, "store subscription error");
            }
        }
    }
    debug!("advertising stop");
}

/// Publishes every reference in the store. Per-reference failures are
/// collected but do not stop the sweep.
async fn provide_all(
    router: &dyn ContentRouter,
    store: &dyn OciStore,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let references = store.list().await?;
    let mut failed = 0usize;
    for reference in &references {
        if let Err(err) = provide_reference(router, store, reference).await {
            error!(%err, image = %reference, "could not advertise image");
            failed += 1;
        }
    }
    if failed > 0 {
        return Err(format!("{failed} of {} references failed", references.len()).into());
    }
    Ok(())
}

/// Publishes one reference: its digest, its tagged name (if any), and
/// every descriptor digest reachable from it.
async fn provide_reference(
    router: &dyn ContentRouter,
    store: &dyn OciStore,
    reference: &Reference,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let mut keys = vec![reference.digest().to_string()];
    if reference.tag().is_some() {
        keys.push(reference.to_string());
    }
    match store.all(reference).await {
        Ok(digests) => keys.extend(digests),
        Err(err) => {
            // The reference itself is still worth advertising.
            error!(%err, image = %reference, "could not get digests for image");
        }
    }

    let count = keys.len();
    router.provide(keys).await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pex_routing::mock::MockRouter;

    use super::*;
    use crate::digest::Digest;
    use crate::store::MemoryStore;

    const D1: &str = "sha256:b060fffe8e1561c9c3e6dea6db487b900100fc26830b9ea2ec966c151ab4c020";
    const D2: &str = "sha256:fa32bd3bcd49a45a62cfc1b0fed6a0b63bf8af95db5bad7ec22865aee0a4b795";
    const LAYER: &str = "sha256:25fad2a32ad1f6f510e528448ae1ec69a28ef81916a004d3629874104f8a7f70";

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .add_image(
                Reference::parse(&format!("docker.io/library/ubuntu:latest@{D1}"), None).unwrap(),
                "application/vnd.oci.image.manifest.v1+json",
                Bytes::from_static(b"manifest"),
                vec![LAYER.to_owned()],
            )
            .await;
        store
            .add_image(
                Reference::parse(
                    &format!("docker.io/library/alpine@{D2}"),
                    Some(&Digest::parse(D2).unwrap()),
                )
                .unwrap(),
                "application/vnd.oci.image.manifest.v1+json",
                Bytes::from_static(b"manifest"),
                vec![],
            )
            .await;
        store
    }

    #[tokio::test]
    async fn refresh_tick_advertises_all_references() {
        let router = Arc::new(MockRouter::new());
        let store = seeded_store().await;
        let (_tx, chunks) = mpsc::channel(8);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(advertise(
            router.clone(),
            store.clone(),
            chunks,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let provided = router.provided_keys();
        assert!(provided.contains(&D1.to_string()));
        assert!(provided.contains(&"docker.io/library/ubuntu:latest".to_string()));
        assert!(provided.contains(&LAYER.to_string()));
        // Untagged reference advertises its digest only.
        assert!(provided.contains(&D2.to_string()));
        assert!(!provided.iter().any(|k| k.contains("alpine")));
    }

    #[tokio::test]
    async fn chunk_keys_are_advertised_as_they_arrive() {
        let router = Arc::new(MockRouter::new());
        let store = Arc::new(MemoryStore::new());
        let (tx, chunks) = mpsc::channel(8);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(advertise(
            router.clone(),
            store.clone(),
            chunks,
            cancel.clone(),
        ));

        tx.send(format!("{D1}_1048576")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(router.provided_keys().contains(&format!("{D1}_1048576")));
    }

    #[tokio::test]
    async fn store_events_trigger_a_single_reference_advertisement() {
        let router = Arc::new(MockRouter::new());
        let store = Arc::new(MemoryStore::new());
        let (_tx, chunks) = mpsc::channel(8);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(advertise(
            router.clone(),
            store.clone(),
            chunks,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        store
            .add_image(
                Reference::parse(&format!("ghcr.io/xenitab/spegel:v0.0.9@{D2}"), None).unwrap(),
                "application/vnd.oci.image.manifest.v1+json",
                Bytes::from_static(b"manifest"),
                vec![],
            )
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        let provided = router.provided_keys();
        assert!(provided.contains(&"ghcr.io/xenitab/spegel:v0.0.9".to_string()));
        assert!(provided.contains(&D2.to_string()));
    }
}
