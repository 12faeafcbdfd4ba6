//! Stable seed derivation.
//!
//! Seeds are derived with SHA-256 so they are identical across runs,
//! processes and platforms. `std::hash` is randomized per process and must
//! never be used here.

use sha2::{Digest, Sha256};

const SEPARATOR: u8 = 0x1f;

/// Derives a 64-bit seed from a global seed and a sequence of labels.
pub fn derive_seed(global_seed: u64, labels: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(global_seed.to_be_bytes());
    for label in labels {
        hasher.update([SEPARATOR]);
        hasher.update(label.as_bytes());
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

/// Seed handed to a single adapter.
pub fn node_seed(global_seed: u64, node_id: &str) -> u64 {
    derive_seed(global_seed, &[node_id])
}

pub(crate) fn link_seed(global_seed: u64, source: &str, destination: &str) -> u64 {
    derive_seed(global_seed, &["link", source, destination])
}
