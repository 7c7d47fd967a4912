//! In-memory [`LogStore`] for tests and ephemeral pollers.
//!
//! All data is lost when the process exits. A batch is applied under a
//! single lock acquisition, so readers never observe half of it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;

use crate::error::PollerError;
use crate::filter::{retention_rules, Filter};
use crate::store::{LogQuery, LogStore, SortOrder, WriteBatch, WriteOp};
use crate::types::{Block, Log};

/// Write counters, for asserting on persistence traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub commits: u64,
    pub filter_inserts: u64,
}

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, Block>,
    /// Keyed by `(block_number, log_index, block_hash)` so iteration is in
    /// chain order; the hash keeps logs from competing forks distinct.
    logs: BTreeMap<(u64, u64, B256), Log>,
    filters: HashMap<String, Filter>,
    stats: MemoryStoreStats,
}

/// In-memory storage for one chain.
pub struct MemoryStore {
    chain_id: u64,
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            inner: Mutex::new(Inner::default()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent commit fail without applying anything.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.lock().stats
    }

    /// Total number of stored logs.
    pub fn log_count(&self) -> usize {
        self.lock().logs.len()
    }

    /// Every stored log, in chain order.
    pub fn all_logs(&self) -> Vec<Log> {
        self.lock().logs.values().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), PollerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PollerError::Storage("write failure injected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn latest_block(&self) -> Result<Option<Block>, PollerError> {
        Ok(self.lock().blocks.values().next_back().cloned())
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, PollerError> {
        Ok(self.lock().blocks.get(&number).cloned())
    }

    async fn blocks_range(&self, min: u64, max: u64) -> Result<Vec<Block>, PollerError> {
        if min > max {
            return Ok(vec![]);
        }
        Ok(self.lock().blocks.range(min..=max).map(|(_, b)| b.clone()).collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), PollerError> {
        self.check_writable()?;
        let mut inner = self.lock();
        for op in batch.into_ops() {
            match op {
                WriteOp::InsertBlock(mut block) => {
                    block.chain_id = self.chain_id;
                    // No two heights may share a hash.
                    let hash = block.hash;
                    inner.blocks.retain(|n, b| *n == block.number || b.hash != hash);
                    inner.blocks.insert(block.number, block);
                }
                WriteOp::InsertLogs(logs) => {
                    for mut log in logs {
                        log.chain_id = self.chain_id;
                        inner
                            .logs
                            .entry(log.key())
                            .or_insert(log);
                    }
                }
                WriteOp::DeleteBlocksAfter(n) => {
                    inner.blocks.retain(|number, _| *number <= n);
                }
                WriteOp::DeleteLogsAfter(n) => {
                    inner.logs.retain(|(number, _, _), _| *number <= n);
                }
            }
        }
        inner.stats.commits += 1;
        Ok(())
    }

    async fn delete_blocks_before(&self, n: u64) -> Result<u64, PollerError> {
        self.check_writable()?;
        let mut inner = self.lock();
        let before = inner.blocks.len();
        inner.blocks.retain(|number, _| *number >= n);
        Ok((before - inner.blocks.len()) as u64)
    }

    async fn delete_expired_logs(
        &self,
        now: i64,
        default_retention: Duration,
    ) -> Result<u64, PollerError> {
        self.check_writable()?;
        let mut inner = self.lock();
        let rules = retention_rules(inner.filters.values(), default_retention);
        let covered: Vec<_> = inner
            .filters
            .values()
            .flat_map(|f| {
                f.addresses
                    .iter()
                    .flat_map(move |a| f.event_sigs.iter().map(move |s| (*a, *s)))
            })
            .collect();
        let default_secs = default_retention.as_secs() as i64;

        let before = inner.logs.len();
        inner.logs.retain(|_, log| {
            let pair = (log.address, log.event_sig);
            match rules.iter().find(|r| (r.address, r.event_sig) == pair) {
                Some(rule) => log.block_timestamp >= now - rule.retention.as_secs() as i64,
                None if covered.contains(&pair) => true,
                None => default_secs == 0 || log.block_timestamp >= now - default_secs,
            }
        });
        Ok((before - inner.logs.len()) as u64)
    }

    async fn insert_filter(&self, filter: &Filter) -> Result<(), PollerError> {
        self.check_writable()?;
        let mut inner = self.lock();
        inner.filters.insert(filter.name.clone(), filter.clone());
        inner.stats.filter_inserts += 1;
        Ok(())
    }

    async fn delete_filter(&self, name: &str) -> Result<(), PollerError> {
        self.check_writable()?;
        self.lock().filters.remove(name);
        Ok(())
    }

    async fn load_filters(&self) -> Result<HashMap<String, Filter>, PollerError> {
        Ok(self.lock().filters.clone())
    }

    async fn select_logs(&self, query: &LogQuery) -> Result<Vec<Log>, PollerError> {
        let inner = self.lock();
        let matching = inner.logs.values().filter(|log| query.matches(log)).cloned();
        let mut logs: Vec<Log> = match query.order {
            SortOrder::Ascending => matching.collect(),
            SortOrder::Descending => {
                let mut v: Vec<Log> = matching.collect();
                v.reverse();
                v
            }
        };
        if let Some(limit) = query.limit {
            logs.truncate(limit);
        }
        Ok(logs)
    }
}
