//! A forkable in-memory chain implementing [`ChainClient`].
//!
//! Blocks live in an arena keyed by hash; each block refers to its parent by
//! hash, and the canonical chain is a list of hashes indexed by number.
//! Forking rewinds the canonical list without touching the arena, so
//! orphaned blocks stay retrievable by hash the way they are on a real node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;

use crate::client::{ChainClient, LogFilterQuery};
use crate::error::PollerError;
use crate::types::{Header, Log};

struct SimBlock {
    header: Header,
    logs: Vec<Log>,
}

struct Inner {
    arena: HashMap<B256, SimBlock>,
    canonical: Vec<B256>,
    next_seq: u64,
    max_log_range: Option<u64>,
    hidden_from_batch: HashSet<u64>,
}

/// Simulated chain for tests and local embedding.
pub struct SimulatedChain {
    chain_id: u64,
    inner: Mutex<Inner>,
    filter_calls: AtomicU64,
}

/// Seconds between simulated blocks.
pub const BLOCK_TIME: i64 = 12;

fn seq_hash(seq: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&seq.to_be_bytes());
    bytes[31] = 0x01;
    B256::from(bytes)
}

impl SimulatedChain {
    /// A chain containing only the genesis block (number 0).
    pub fn new(chain_id: u64) -> Self {
        let genesis = Header {
            number: 0,
            hash: seq_hash(1),
            parent_hash: B256::ZERO,
            timestamp: 1_700_000_000,
        };
        let mut arena = HashMap::new();
        let canonical = vec![genesis.hash];
        arena.insert(genesis.hash, SimBlock { header: genesis, logs: Vec::new() });
        Self {
            chain_id,
            inner: Mutex::new(Inner {
                arena,
                canonical,
                next_seq: 2,
                max_log_range: None,
                hidden_from_batch: HashSet::new(),
            }),
            filter_calls: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `count` blocks to the canonical head. Returns the new head.
    pub fn mine(&self, count: u64) -> Header {
        let mut inner = self.lock();
        for _ in 0..count {
            let parent = match inner.canonical.last().and_then(|h| inner.arena.get(h)) {
                Some(b) => b.header.clone(),
                None => break,
            };
            let header = Header {
                number: parent.number + 1,
                hash: seq_hash(inner.next_seq),
                parent_hash: parent.hash,
                timestamp: parent.timestamp + BLOCK_TIME,
            };
            inner.next_seq += 1;
            inner.canonical.push(header.hash);
            inner.arena.insert(header.hash, SimBlock { header, logs: Vec::new() });
        }
        self.head_locked(&inner)
    }

    /// Make the block at `number` the canonical head, orphaning everything
    /// above it. The next [`mine`](Self::mine) starts a competing branch.
    pub fn fork_at(&self, number: u64) {
        let mut inner = self.lock();
        inner.canonical.truncate(number as usize + 1);
    }

    /// Emit a log in the canonical block at `number`.
    pub fn emit(
        &self,
        number: u64,
        address: Address,
        event_sig: B256,
        extra_topics: Vec<B256>,
        data: Vec<u8>,
    ) -> Option<Log> {
        let mut inner = self.lock();
        let hash = *inner.canonical.get(number as usize)?;
        let block = inner.arena.get_mut(&hash)?;
        let mut topics = vec![event_sig];
        topics.extend(extra_topics);
        let log = Log {
            chain_id: self.chain_id,
            log_index: block.logs.len() as u64,
            block_hash: hash,
            block_number: number,
            block_timestamp: 0,
            address,
            event_sig,
            topics,
            data: Bytes::from(data),
            tx_hash: seq_hash(u64::MAX - number),
        };
        block.logs.push(log.clone());
        Some(log)
    }

    /// Make ranged log queries spanning more than `blocks` fail with a
    /// result-limit error.
    pub fn set_max_log_range(&self, blocks: Option<u64>) {
        self.lock().max_log_range = blocks;
    }

    /// Report `number` as unknown in batched header lookups.
    pub fn hide_from_batch(&self, number: u64) {
        self.lock().hidden_from_batch.insert(number);
    }

    pub fn head(&self) -> Header {
        self.head_locked(&self.lock())
    }

    /// Canonical header at `number`.
    pub fn header(&self, number: u64) -> Option<Header> {
        let inner = self.lock();
        canonical_header(&inner, number)
    }

    /// Number of `filter_logs` calls served so far.
    pub fn filter_calls(&self) -> u64 {
        self.filter_calls.load(Ordering::Relaxed)
    }

    fn head_locked(&self, inner: &Inner) -> Header {
        let number = inner.canonical.len().saturating_sub(1) as u64;
        canonical_header(inner, number).unwrap_or(Header {
            number: 0,
            hash: B256::ZERO,
            parent_hash: B256::ZERO,
            timestamp: 0,
        })
    }
}

fn canonical_header(inner: &Inner, number: u64) -> Option<Header> {
    let hash = inner.canonical.get(number as usize)?;
    inner.arena.get(hash).map(|b| b.header.clone())
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Option<Header>, PollerError> {
        let inner = self.lock();
        Ok(match number {
            Some(n) => canonical_header(&inner, n),
            None => Some(self.head_locked(&inner)),
        })
    }

    async fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, PollerError> {
        Ok(self.lock().arena.get(&hash).map(|b| b.header.clone()))
    }

    async fn filter_logs(&self, query: &LogFilterQuery) -> Result<Vec<Log>, PollerError> {
        self.filter_calls.fetch_add(1, Ordering::Relaxed);
        let inner = self.lock();

        if let Some(hash) = query.block_hash {
            let logs = inner
                .arena
                .get(&hash)
                .map(|b| b.logs.iter().filter(|l| query.matches(l)).cloned().collect())
                .unwrap_or_default();
            return Ok(logs);
        }

        let head = inner.canonical.len().saturating_sub(1) as u64;
        let from = query.from_block.unwrap_or(0);
        let to = query.to_block.unwrap_or(head).min(head);
        if from > to {
            return Ok(vec![]);
        }
        if let Some(max) = inner.max_log_range {
            if to - from + 1 > max {
                return Err(PollerError::ResultLimitExceeded(format!(
                    "query spans {} blocks, limit is {max}",
                    to - from + 1
                )));
            }
        }

        let mut logs = Vec::new();
        for number in from..=to {
            let Some(block) = inner.canonical.get(number as usize).and_then(|h| inner.arena.get(h))
            else {
                continue;
            };
            logs.extend(block.logs.iter().filter(|l| query.matches(l)).cloned());
        }
        Ok(logs)
    }

    async fn batch_headers(&self, numbers: &[u64]) -> Result<Vec<Option<Header>>, PollerError> {
        let inner = self.lock();
        Ok(numbers
            .iter()
            .map(|n| {
                if inner.hidden_from_batch.contains(n) {
                    None
                } else {
                    canonical_header(&inner, *n)
                }
            })
            .collect())
    }
}
