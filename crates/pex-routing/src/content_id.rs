//! Deterministic content IDs for routing keys.
//!
//! Any string key (chunk key, digest, tagged reference) maps to a CIDv1
//! with the raw codec over the SHA-256 of its UTF-8 bytes. Every node
//! must derive identical bytes for identical keys; the DHT record key is
//! the CID's binary form.

use cid::Cid;
use libp2p::kad;
use multihash::Multihash;
use sha2::{Digest as _, Sha256};

/// Multicodec code for raw payloads.
const RAW_CODEC: u64 = 0x55;

/// Multihash code for SHA2-256.
const SHA2_256: u64 = 0x12;

/// Returns the CIDv1 of a routing key.
pub fn content_id(key: &str) -> Cid {
    let digest = Sha256::digest(key.as_bytes());
    let hash = Multihash::<64>::wrap(SHA2_256, &digest)
        .expect("sha-256 digest always fits a 64-byte multihash");
    Cid::new_v1(RAW_CODEC, hash)
}

/// Returns the DHT record key of a routing key.
pub fn record_key(key: &str) -> kad::RecordKey {
    kad::RecordKey::new(&content_id(key).to_bytes())
}
