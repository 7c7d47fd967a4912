//! Shared types for the log poller.

use alloy_primitives::{Address, Bytes, B256};
use serde::{Deserialize, Serialize};

// ─── Header ──────────────────────────────────────────────────────────────────

/// A block header as reported by the remote chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl Header {
    /// Returns `true` if `parent` is the persisted direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }

    /// Convert into the persisted block row for `chain_id`.
    pub fn to_block(&self, chain_id: u64) -> Block {
        Block {
            chain_id,
            number: self.number,
            hash: self.hash,
            timestamp: self.timestamp,
        }
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A persisted chain-frontier record.
///
/// The parent hash is not stored; it is implied by the block at `number - 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: u64,
    pub number: u64,
    pub hash: B256,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

// ─── Log ─────────────────────────────────────────────────────────────────────

/// An event log, either freshly fetched or persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub chain_id: u64,
    pub log_index: u64,
    pub block_hash: B256,
    pub block_number: u64,
    /// Unix timestamp of the containing block; zero until resolved.
    pub block_timestamp: i64,
    pub address: Address,
    /// Topic 0.
    pub event_sig: B256,
    /// All topics, topic 0 included.
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub tx_hash: B256,
}

/// Width of an indexed topic and of a data word, in bytes.
pub const WORD_SIZE: usize = 32;

impl Log {
    /// Identity used for idempotent insertion, ordered by position. The
    /// block hash keeps copies from competing forks apart.
    pub fn key(&self) -> (u64, u64, B256) {
        (self.block_number, self.log_index, self.block_hash)
    }

    /// The topic at `index` (0 is the event signature).
    pub fn topic(&self, index: usize) -> Option<&B256> {
        self.topics.get(index)
    }

    /// The 32-byte data word at `index` (byte offset `32 * index`).
    pub fn data_word(&self, index: usize) -> Option<B256> {
        let start = index.checked_mul(WORD_SIZE)?;
        let word = self.data.get(start..start + WORD_SIZE)?;
        Some(B256::from_slice(word))
    }
}
