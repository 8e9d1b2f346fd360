//! The local OCI content store interface.
//!
//! The proxy consumes this interface; the production implementation
//! (a containerd client) lives outside this workspace. [`MemoryStore`]
//! backs standalone deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::digest::Digest;
use crate::reference::{Reference, ReferenceError};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content {0} not found in store")]
    NotFound(String),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Streams handed to the single subscriber: new or updated references,
/// and subscription errors (logged, never fatal).
pub struct StoreEvents {
    pub references: mpsc::Receiver<Reference>,
    pub errors: mpsc::Receiver<StoreError>,
}

/// The content store operations the proxy depends on.
#[async_trait]
pub trait OciStore: Send + Sync {
    /// Confirms the store is reachable.
    async fn verify(&self) -> Result<(), StoreError>;

    /// Hands out the event streams. At most one subscriber; later calls
    /// receive closed streams.
    fn subscribe(&self) -> StoreEvents;

    /// All image references known to the store.
    async fn list(&self) -> Result<Vec<Reference>, StoreError>;

    /// The digests of every descriptor reachable from `reference`
    /// (manifests, config, layers).
    async fn all(&self, reference: &Reference) -> Result<Vec<String>, StoreError>;

    /// Resolves a reference string to its manifest digest.
    async fn resolve(&self, reference: &str) -> Result<Digest, StoreError>;

    /// The size in bytes of the content at `digest`.
    async fn size(&self, digest: &Digest) -> Result<u64, StoreError>;

    /// The raw bytes and media type of the (manifest) content at
    /// `digest`.
    async fn bytes(&self, digest: &Digest) -> Result<(Bytes, String), StoreError>;

    /// The raw bytes of the (blob) content at `digest`.
    async fn blob(&self, digest: &Digest) -> Result<Bytes, StoreError>;
}

#[derive(Debug, Clone)]
struct Content {
    data: Bytes,
    media_type: String,
}

#[derive(Default)]
struct Inner {
    references: Vec<Reference>,
    content: HashMap<Digest, Content>,
    descriptors: HashMap<Digest, Vec<String>>,
}

/// In-memory [`OciStore`].
pub struct MemoryStore {
    inner: RwLock<Inner>,
    events: Mutex<Option<StoreEvents>>,
    reference_tx: mpsc::Sender<Reference>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (reference_tx, references) = mpsc::channel(64);
        let (_error_tx, errors) = mpsc::channel(1);
        Self {
            inner: RwLock::new(Inner::default()),
            events: Mutex::new(Some(StoreEvents { references, errors })),
            reference_tx,
        }
    }

    /// Registers an image: its reference, manifest content, and the
    /// digests of its constituent descriptors. Emits a reference event.
    pub async fn add_image(
        &self,
        reference: Reference,
        media_type: &str,
        manifest: Bytes,
        descriptors: Vec<String>,
    ) {
        {
            let mut inner = self.inner.write();
            inner.content.insert(
                reference.digest().clone(),
                Content {
                    data: manifest,
                    media_type: media_type.to_owned(),
                },
            );
            inner
                .descriptors
                .insert(reference.digest().clone(), descriptors);
            inner.references.push(reference.clone());
        }
        let _ = self.reference_tx.send(reference).await;
    }

    /// Registers a standalone blob.
    pub fn add_blob(&self, digest: Digest, media_type: &str, data: Bytes) {
        self.inner.write().content.insert(
            digest,
            Content {
                data,
                media_type: media_type.to_owned(),
            },
        );
    }

    fn content(&self, digest: &Digest) -> Result<Content, StoreError> {
        self.inner
            .read()
            .content
            .get(digest)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(digest.to_string()))
    }
}

#[async_trait]
impl OciStore for MemoryStore {
    async fn verify(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn subscribe(&self) -> StoreEvents {
        self.events.lock().take().unwrap_or_else(|| {
            let (_, references) = mpsc::channel(1);
            let (_, errors) = mpsc::channel(1);
            StoreEvents { references, errors }
        })
    }

    async fn list(&self) -> Result<Vec<Reference>, StoreError> {
        Ok(self.inner.read().references.clone())
    }

    async fn all(&self, reference: &Reference) -> Result<Vec<String>, StoreError> {
        self.inner
            .read()
            .descriptors
            .get(reference.digest())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    async fn resolve(&self, reference: &str) -> Result<Digest, StoreError> {
        let inner = self.inner.read();
        inner
            .references
            .iter()
            .find(|r| r.to_string() == reference)
            .map(|r| r.digest().clone())
            .ok_or_else(|| StoreError::NotFound(reference.to_owned()))
    }

    async fn size(&self, digest: &Digest) -> Result<u64, StoreError> {
        Ok(self.content(digest)?.data.len() as u64)
    }

    async fn bytes(&self, digest: &Digest) -> Result<(Bytes, String), StoreError> {
        let content = self.content(digest)?;
        Ok((content.data, content.media_type))
    }

    async fn blob(&self, digest: &Digest) -> Result<Bytes, StoreError> {
        Ok(self.content(digest)?.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: &str = "sha256:bb863d6b95453b6b10dfaa1a52cb53f453d9a97ee775808ebaf6533bb4c9bb30";

    fn reference() -> Reference {
        Reference::parse(&format!("docker.io/library/alpine:3.18.0@{D}"), None).unwrap()
    }

    #[tokio::test]
    async fn add_image_is_listable_and_resolvable() {
        let store = MemoryStore::new();
        store
            .add_image(
                reference(),
                "application/vnd.oci.image.manifest.v1+json",
                Bytes::from_static(b"test"),
                vec!["sha256:aaa".into()],
            )
            .await;

        let refs = store.list().await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(
            store
                .resolve("docker.io/library/alpine:3.18.0")
                .await
                .unwrap()
                .as_str(),
            D
        );
        let digest = Digest::parse(D).unwrap();
        assert_eq!(store.size(&digest).await.unwrap(), 4);
        let (data, media_type) = store.bytes(&digest).await.unwrap();
        assert_eq!(&data[..], b"test");
        assert_eq!(media_type, "application/vnd.oci.image.manifest.v1+json");
    }

    #[tokio::test]
    async fn subscribe_sees_added_images() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();
        store
            .add_image(reference(), "m", Bytes::from_static(b"x"), vec![])
            .await;
        let seen = events.references.recv().await.unwrap();
        assert_eq!(seen, reference());
    }

    #[tokio::test]
    async fn unknown_content_is_not_found() {
        let store = MemoryStore::new();
        let digest = Digest::parse(D).unwrap();
        assert!(matches!(
            store.size(&digest).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
