//! The storage collaborator: durable blocks, logs and filter registrations.
//!
//! Implementations include [`MemoryStore`](crate::memory::MemoryStore) and the
//! SQLite backend in `logpoller-storage`.

use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::PollerError;
use crate::filter::Filter;
use crate::types::{Block, Log};

// ─── Writes ──────────────────────────────────────────────────────────────────

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or replace the block at `block.number`.
    InsertBlock(Block),
    /// Insert logs, ignoring any already present with the same
    /// `(chain_id, block_hash, log_index)`.
    InsertLogs(Vec<Log>),
    /// Delete blocks with `number > n`.
    DeleteBlocksAfter(u64),
    /// Delete logs with `block_number > n`.
    DeleteLogsAfter(u64),
}

/// An ordered group of writes that a store must apply atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_block(mut self, block: Block) -> Self {
        self.ops.push(WriteOp::InsertBlock(block));
        self
    }

    pub fn insert_logs(mut self, logs: Vec<Log>) -> Self {
        if !logs.is_empty() {
            self.ops.push(WriteOp::InsertLogs(logs));
        }
        self
    }

    pub fn delete_blocks_after(mut self, n: u64) -> Self {
        self.ops.push(WriteOp::DeleteBlocksAfter(n));
        self
    }

    pub fn delete_logs_after(mut self, n: u64) -> Self {
        self.ops.push(WriteOp::DeleteLogsAfter(n));
        self
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// ─── Reads ───────────────────────────────────────────────────────────────────

/// Predicate over a 32-byte value (an indexed topic or a data word).
///
/// Values compare as unsigned big-endian integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueMatch {
    /// Equal to any of the given values.
    AnyOf(Vec<B256>),
    /// Within `[min, max]`, inclusive.
    Range { min: B256, max: B256 },
    /// Greater than or equal to the given value.
    AtLeast(B256),
}

impl ValueMatch {
    pub fn matches(&self, value: &B256) -> bool {
        match self {
            Self::AnyOf(values) => values.contains(value),
            Self::Range { min, max } => value >= min && value <= max,
            Self::AtLeast(min) => value >= min,
        }
    }
}

/// Predicate on the topic at `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPredicate {
    pub index: usize,
    pub value: ValueMatch,
}

/// Predicate on the data word at `index` (byte offset `32 * index`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordPredicate {
    pub index: usize,
    pub value: ValueMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first, by `(block_number, log_index)`.
    #[default]
    Ascending,
    Descending,
}

/// A structured selection over persisted logs. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Vec<Address>,
    pub event_sigs: Vec<B256>,
    pub topics: Vec<TopicPredicate>,
    pub words: Vec<WordPredicate>,
    /// Only logs whose block timestamp is strictly after this (unix seconds).
    pub after_timestamp: Option<i64>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl LogQuery {
    /// Returns `true` if `log` satisfies every predicate (ignores order and limit).
    pub fn matches(&self, log: &Log) -> bool {
        if self.from_block.is_some_and(|from| log.block_number < from) {
            return false;
        }
        if self.to_block.is_some_and(|to| log.block_number > to) {
            return false;
        }
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        if !self.event_sigs.is_empty() && !self.event_sigs.contains(&log.event_sig) {
            return false;
        }
        if self.after_timestamp.is_some_and(|after| log.block_timestamp <= after) {
            return false;
        }
        let topics_ok = self.topics.iter().all(|p| {
            log.topic(p.index).is_some_and(|t| p.value.matches(t))
        });
        let words_ok = self.words.iter().all(|p| {
            log.data_word(p.index).is_some_and(|w| p.value.matches(&w))
        });
        topics_ok && words_ok
    }
}

// ─── LogStore ────────────────────────────────────────────────────────────────

/// Durable storage for one chain's blocks, logs and filter registrations.
///
/// Every method is scoped to the chain the store was opened for.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// The highest-numbered persisted block.
    async fn latest_block(&self) -> Result<Option<Block>, PollerError>;

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, PollerError>;

    /// Persisted blocks with `min <= number <= max`, ascending.
    async fn blocks_range(&self, min: u64, max: u64) -> Result<Vec<Block>, PollerError>;

    /// Apply every operation in `batch` atomically: all commit or none do.
    async fn commit(&self, batch: WriteBatch) -> Result<(), PollerError>;

    /// Delete blocks with `number < n`. Returns the number of rows removed.
    async fn delete_blocks_before(&self, n: u64) -> Result<u64, PollerError>;

    /// Delete logs past their filter's retention as of `now` (unix seconds).
    /// Returns the number of rows removed.
    async fn delete_expired_logs(
        &self,
        now: i64,
        default_retention: Duration,
    ) -> Result<u64, PollerError>;

    /// Insert or replace a filter registration.
    async fn insert_filter(&self, filter: &Filter) -> Result<(), PollerError>;

    async fn delete_filter(&self, name: &str) -> Result<(), PollerError>;

    async fn load_filters(&self) -> Result<HashMap<String, Filter>, PollerError>;

    async fn select_logs(&self, query: &LogQuery) -> Result<Vec<Log>, PollerError>;

    async fn insert_block(&self, block: Block) -> Result<(), PollerError> {
        self.commit(WriteBatch::new().insert_block(block)).await
    }

    async fn insert_logs(&self, logs: Vec<Log>) -> Result<(), PollerError> {
        self.commit(WriteBatch::new().insert_logs(logs)).await
    }

    async fn delete_blocks_after(&self, n: u64) -> Result<(), PollerError> {
        self.commit(WriteBatch::new().delete_blocks_after(n)).await
    }

    async fn delete_logs_after(&self, n: u64) -> Result<(), PollerError> {
        self.commit(WriteBatch::new().delete_logs_after(n)).await
    }
}
