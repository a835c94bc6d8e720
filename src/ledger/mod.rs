pub mod store;

use serde::{Deserialize, Serialize};

use crate::hash::{H32, H32_EMPTY, SequenceHash};

/// Consecutive rounds per primary/raw shard database.
pub const PRIMARY_SHARD_SIZE: u64 = 256;
pub const RAW_SHARD_SIZE: u64 = 256;

pub const PRIMARY_DIR: &str = "/primary";
pub const RAW_DIR: &str = "/raw";

/// Shard a sequence number falls into.
pub fn shard_no(seq_no: u64, shard_size: u64) -> u64 {
    seq_no / shard_size
}

/// One round's signed, hash-chained summary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub seq_no: u64,
    pub timestamp: u64,
    pub ledger_hash: H32,
    pub prev_ledger_hash: H32,
    pub data_hash: H32,
    pub state_hash: H32,
    pub config_hash: H32,
    pub nonce: H32,
    pub user_hash: H32,
    pub input_hash: H32,
    pub output_hash: H32,
}

impl LedgerRecord {
    /// The implicit record every chain starts from.
    pub fn genesis() -> Self {
        Self::default()
    }

    pub fn id(&self) -> SequenceHash {
        SequenceHash::new(self.seq_no, self.ledger_hash)
    }

    /// Chain hash over every other field, in schema order.
    pub fn compute_ledger_hash(&self) -> H32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prev_ledger_hash.as_bytes());
        hasher.update(&self.seq_no.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(self.data_hash.as_bytes());
        hasher.update(self.state_hash.as_bytes());
        hasher.update(self.config_hash.as_bytes());
        hasher.update(self.nonce.as_bytes());
        hasher.update(self.user_hash.as_bytes());
        hasher.update(self.input_hash.as_bytes());
        hasher.update(self.output_hash.as_bytes());
        H32(*hasher.finalize().as_bytes())
    }

    pub fn seal(&mut self) {
        self.ledger_hash = self.compute_ledger_hash();
    }

    /// Chain invariant against the preceding record.
    pub fn extends(&self, prev: &LedgerRecord) -> bool {
        self.seq_no == prev.seq_no + 1
            && self.prev_ledger_hash == prev.ledger_hash
            && self.ledger_hash == self.compute_ledger_hash()
    }

    pub fn is_genesis(&self) -> bool {
        self.seq_no == 0 && self.ledger_hash == H32_EMPTY
    }
}

/// Raw-shard row describing one user input of a round. The payload bytes
/// live in the shard's buffer store at `(blob_offset, blob_size)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerUserInput {
    pub ledger_seq_no: u64,
    pub pubkey: Vec<u8>,
    pub hash: H32,
    pub nonce: u64,
    pub blob_offset: i64,
    pub blob_size: u32,
}

/// Raw-shard row describing one user's outputs of a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerUserOutput {
    pub ledger_seq_no: u64,
    pub pubkey: Vec<u8>,
    pub hash: H32,
    pub blob_offset: i64,
    pub blob_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    #[test]
    fn sealed_record_extends_previous() {
        let genesis = LedgerRecord::genesis();
        let mut next = LedgerRecord {
            seq_no: 1,
            timestamp: 42,
            prev_ledger_hash: genesis.ledger_hash,
            state_hash: hash_bytes(b"state"),
            ..LedgerRecord::default()
        };
        next.seal();
        assert!(next.extends(&genesis));

        let mut skipped = next.clone();
        skipped.seq_no = 3;
        skipped.seal();
        assert!(!skipped.extends(&genesis));
    }

    #[test]
    fn ledger_hash_covers_every_field() {
        let mut record = LedgerRecord {
            seq_no: 5,
            timestamp: 9,
            ..LedgerRecord::default()
        };
        record.seal();
        let sealed = record.ledger_hash;
        record.output_hash = hash_bytes(b"outputs");
        assert_ne!(record.compute_ledger_hash(), sealed);
    }

    #[test]
    fn shard_no_buckets_by_fixed_size() {
        assert_eq!(shard_no(0, PRIMARY_SHARD_SIZE), 0);
        assert_eq!(shard_no(255, PRIMARY_SHARD_SIZE), 0);
        assert_eq!(shard_no(256, PRIMARY_SHARD_SIZE), 1);
    }
}
