use std::fmt;
use std::ops::BitXorAssign;

use serde::{Deserialize, Serialize};

/// 32-byte content hash used throughout the node: filesystem entries,
/// ledger chain links, proposal digests and XOR-folded set reductions.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct H32(pub [u8; 32]);

/// The all-zero hash. Stands in for "no value" in chain links and nonces.
pub const H32_EMPTY: H32 = H32([0u8; 32]);

impl H32 {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == H32_EMPTY
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl BitXorAssign for H32 {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

impl fmt::Display for H32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for H32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H32({})", self.to_hex())
    }
}

/// Hash an opaque byte buffer.
pub fn hash_bytes(data: &[u8]) -> H32 {
    H32(*blake3::hash(data).as_bytes())
}

/// Hash a sequence of buffers as if they were concatenated.
pub fn hash_parts(parts: &[&[u8]]) -> H32 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    H32(*hasher.finalize().as_bytes())
}

/// XOR-fold a set of per-entry hashes. The reduction is order-insensitive,
/// which is what lets validators combine user/input/output fingerprints
/// without agreeing on an ordering first.
pub fn xor_reduce<'a, I>(hashes: I) -> H32
where
    I: IntoIterator<Item = &'a H32>,
{
    let mut acc = H32_EMPTY;
    for h in hashes {
        acc ^= *h;
    }
    acc
}

/// Identifies a point in any hash-chained sequence: a ledger seq no paired
/// with the hash recorded at that position.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SequenceHash {
    pub seq_no: u64,
    pub hash: H32,
}

impl SequenceHash {
    pub fn new(seq_no: u64, hash: H32) -> Self {
        Self { seq_no, hash }
    }
}

impl fmt::Display for SequenceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seq_no, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_reduce_is_order_insensitive() {
        let a = hash_bytes(b"alpha");
        let b = hash_bytes(b"beta");
        let c = hash_bytes(b"gamma");
        let forward = xor_reduce([&a, &b, &c]);
        let backward = xor_reduce([&c, &a, &b]);
        assert_eq!(forward, backward);
        assert_ne!(forward, H32_EMPTY);
    }

    #[test]
    fn xor_with_self_cancels() {
        let a = hash_bytes(b"alpha");
        let mut acc = a;
        acc ^= a;
        assert_eq!(acc, H32_EMPTY);
    }

    #[test]
    fn ordering_is_lexicographic_on_bytes() {
        let low = H32([0u8; 32]);
        let mut high = [0u8; 32];
        high[0] = 1;
        let high = H32(high);
        assert!(low < high);
    }

    #[test]
    fn hash_parts_matches_concatenation() {
        let joined = hash_bytes(b"helloworld");
        let split = hash_parts(&[b"hello", b"world"]);
        assert_eq!(joined, split);
    }

    #[test]
    fn sequence_hash_equality_is_componentwise() {
        let h = hash_bytes(b"tip");
        assert_eq!(SequenceHash::new(4, h), SequenceHash::new(4, h));
        assert_ne!(SequenceHash::new(4, h), SequenceHash::new(5, h));
        assert_ne!(
            SequenceHash::new(4, h),
            SequenceHash::new(4, hash_bytes(b"other"))
        );
    }
}
