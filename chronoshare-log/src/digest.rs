//! The digest tree: a deterministic hash over the sync-state vector.

use chronoshare_types::{Hash, Name};
use sha2::{Digest, Sha256};

/// Compute the root digest of a sync-state vector.
///
/// Canonical form: devices sorted ascending by their wire encoding; each
/// contributes `H(wire(device) ∥ seq_le64)`; the root is the hash of the
/// concatenation. A pure function of the (device, seq) entries, so two
/// peers holding the same vector always agree on the root.
pub fn state_digest<'a, I>(entries: I) -> Hash
where
    I: IntoIterator<Item = (&'a Name, u64)>,
{
    let mut leaves: Vec<(Vec<u8>, u64)> = entries
        .into_iter()
        .map(|(device, seq)| (device.wire_encode(), seq))
        .collect();
    leaves.sort();

    let mut root = Sha256::new();
    for (device_bytes, seq) in leaves {
        let mut leaf = Sha256::new();
        leaf.update(&device_bytes);
        leaf.update(seq.to_le_bytes());
        root.update(leaf.finalize());
    }
    Hash::from_bytes(&root.finalize()).expect("sha256 output is 32 bytes")
}
