//! blake3 helpers shared by the log, snapshots and batch digests.

/// Feed a length-prefixed string so adjacent fields cannot run together.
pub fn hash_str(hasher: &mut blake3::Hasher, s: &str) {
    let len = s.len() as u32;
    hasher.update(&len.to_le_bytes());
    hasher.update(s.as_bytes());
}
