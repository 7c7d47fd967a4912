//! Bulk log retrieval for finalized ranges, and block-number resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::client::ChainClient;
use crate::error::PollerError;
use crate::metrics::PollerMetrics;
use crate::registry::FilterRegistry;
use crate::store::{LogStore, WriteBatch};
use crate::types::Block;

/// Fetches finalized log ranges in batches and resolves block numbers to
/// block records, store first.
pub struct RangeFetcher {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn LogStore>,
    registry: Arc<FilterRegistry>,
    metrics: Arc<PollerMetrics>,
    /// Current blocks per log query. Only ever shrinks.
    batch_size: AtomicU64,
    rpc_batch_size: usize,
}

impl RangeFetcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn LogStore>,
        registry: Arc<FilterRegistry>,
        metrics: Arc<PollerMetrics>,
        backfill_batch_size: u64,
        rpc_batch_size: usize,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            metrics,
            batch_size: AtomicU64::new(backfill_batch_size.max(1)),
            rpc_batch_size: rpc_batch_size.max(1),
        }
    }

    /// Blocks per log query used by the next backfill batch.
    pub fn batch_size(&self) -> u64 {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Fetch and persist the logs of every block in `[start, end]`.
    ///
    /// When the provider reports a result limit, the batch size is halved and
    /// the same start retried. Logs are committed once per batch; block rows
    /// are not written.
    pub async fn backfill(&self, start: u64, end: u64) -> Result<(), PollerError> {
        info!(start, end, batch_size = self.batch_size(), "Backfilling finalized range");
        let mut from = start;
        while from <= end {
            let size = self.batch_size();
            let to = from.saturating_add(size - 1).min(end);
            let query = self.registry.effective_query().as_ref().clone().with_range(from, to);

            let mut logs = match self.client.filter_logs(&query).await {
                Ok(logs) => logs,
                Err(e) if e.is_result_limit() => {
                    if size <= 1 {
                        return Err(PollerError::BackfillLimitExceeded {
                            block_number: from,
                            reason: e.to_string(),
                        });
                    }
                    let shrunk = size / 2;
                    self.batch_size.store(shrunk, Ordering::Relaxed);
                    self.metrics.record_batch_shrink();
                    warn!(from, to, old = size, new = shrunk, "Result limit hit, shrinking backfill batch");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !logs.is_empty() {
                let numbers: Vec<u64> = logs.iter().map(|l| l.block_number).collect();
                let timestamps: HashMap<u64, i64> = self
                    .resolve_blocks(&numbers)
                    .await?
                    .into_iter()
                    .map(|b| (b.number, b.timestamp))
                    .collect();
                for log in &mut logs {
                    if let Some(ts) = timestamps.get(&log.block_number) {
                        log.block_timestamp = *ts;
                    }
                }
                let count = logs.len();
                self.store.commit(WriteBatch::new().insert_logs(logs)).await?;
                self.metrics.record_backfilled(count);
                debug!(from, to, logs = count, "Backfilled batch");
            }

            match to.checked_add(1) {
                Some(next) => from = next,
                None => break,
            }
        }
        Ok(())
    }

    /// Resolve `numbers` to block records, ascending by number.
    ///
    /// Persisted blocks are used where present; the rest are fetched in
    /// batched header lookups. Fails with [`PollerError::BlocksNotFound`]
    /// listing every number neither source could supply.
    pub async fn resolve_blocks(&self, numbers: &[u64]) -> Result<Vec<Block>, PollerError> {
        let wanted: BTreeSet<u64> = numbers.iter().copied().collect();
        let (Some(&min), Some(&max)) = (wanted.first(), wanted.last()) else {
            return Ok(vec![]);
        };

        let mut found: BTreeMap<u64, Block> = match self.store.blocks_range(min, max).await {
            Ok(blocks) => blocks
                .into_iter()
                .filter(|b| wanted.contains(&b.number))
                .map(|b| (b.number, b))
                .collect(),
            Err(e) => {
                warn!(min, max, error = %e, "Store lookup failed, resolving blocks remotely");
                BTreeMap::new()
            }
        };

        let missing: Vec<u64> = wanted.iter().filter(|n| !found.contains_key(n)).copied().collect();
        let chain_id = self.client.chain_id();
        for chunk in missing.chunks(self.rpc_batch_size) {
            let headers = self.client.batch_headers(chunk).await?;
            for (&requested, header) in chunk.iter().zip(headers) {
                let Some(header) = header else { continue };
                if header.hash.is_zero() {
                    return Err(PollerError::InvalidHeader {
                        number: requested,
                        reason: "zero block hash".into(),
                    });
                }
                if header.number != requested {
                    return Err(PollerError::HeaderNumberMismatch {
                        requested,
                        got: header.number,
                    });
                }
                found.insert(requested, header.to_block(chain_id));
            }
        }

        let unresolved: Vec<u64> = wanted.iter().filter(|n| !found.contains_key(n)).copied().collect();
        if !unresolved.is_empty() {
            return Err(PollerError::BlocksNotFound(unresolved));
        }
        Ok(found.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::memory::MemoryStore;
    use crate::sim::SimulatedChain;
    use alloy_primitives::{Address, B256};

    fn sig() -> B256 {
        B256::repeat_byte(0xee)
    }

    fn addr() -> Address {
        Address::repeat_byte(0x11)
    }

    struct Fixture {
        chain: Arc<SimulatedChain>,
        store: Arc<MemoryStore>,
        fetcher: RangeFetcher,
    }

    async fn fixture(batch: u64) -> Fixture {
        let chain = Arc::new(SimulatedChain::new(1));
        let store = Arc::new(MemoryStore::new(1));
        let registry = Arc::new(FilterRegistry::new(store.clone()));
        registry
            .register(Filter::new("test").event(sig()).address(addr()))
            .await
            .unwrap();
        let fetcher = RangeFetcher::new(
            chain.clone(),
            store.clone(),
            registry,
            Arc::new(PollerMetrics::default()),
            batch,
            2,
        );
        Fixture { chain, store, fetcher }
    }

    #[tokio::test]
    async fn backfill_shrinks_batch_and_persists_once() {
        let f = fixture(8).await;
        f.chain.mine(30);
        for n in 10..=20 {
            f.chain.emit(n, addr(), sig(), vec![], vec![]).unwrap();
        }
        f.chain.set_max_log_range(Some(2));

        f.fetcher.backfill(10, 20).await.unwrap();

        assert!(f.fetcher.batch_size() <= 2);
        let logs = f.store.all_logs();
        let numbers: Vec<u64> = logs.iter().map(|l| l.block_number).collect();
        assert_eq!(numbers, (10..=20).collect::<Vec<_>>());
        for log in &logs {
            assert_eq!(log.block_timestamp, f.chain.header(log.block_number).unwrap().timestamp);
        }
        // Backfill never writes block rows.
        assert!(f.store.latest_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn backfill_fails_when_single_block_exceeds_limit() {
        let f = fixture(8).await;
        f.chain.mine(5);
        f.chain.set_max_log_range(Some(0));
        let err = f.fetcher.backfill(1, 3).await.unwrap_err();
        assert!(matches!(err, PollerError::BackfillLimitExceeded { block_number: 1, .. }));
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn backfill_ignores_unregistered_logs() {
        let f = fixture(100).await;
        f.chain.mine(5);
        f.chain.emit(2, Address::repeat_byte(0x99), sig(), vec![], vec![]).unwrap();
        f.chain.emit(3, addr(), sig(), vec![], vec![]).unwrap();
        f.fetcher.backfill(1, 5).await.unwrap();
        assert_eq!(f.store.log_count(), 1);
    }

    #[tokio::test]
    async fn resolve_blocks_falls_back_to_remote() {
        let f = fixture(8).await;
        f.chain.mine(10);
        for n in [5, 7] {
            f.store.insert_block(f.chain.header(n).unwrap().to_block(1)).await.unwrap();
        }

        let blocks = f.fetcher.resolve_blocks(&[7, 5, 6]).await.unwrap();
        let numbers: Vec<u64> = blocks.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![5, 6, 7]);
        assert_eq!(blocks[1].hash, f.chain.header(6).unwrap().hash);
    }

    #[tokio::test]
    async fn resolve_blocks_reports_unresolvable() {
        let f = fixture(8).await;
        f.chain.mine(10);
        for n in [5, 7] {
            f.store.insert_block(f.chain.header(n).unwrap().to_block(1)).await.unwrap();
        }
        f.chain.hide_from_batch(6);

        let err = f.fetcher.resolve_blocks(&[5, 6, 7]).await.unwrap_err();
        assert!(matches!(err, PollerError::BlocksNotFound(ref n) if n == &vec![6]));
    }

    #[tokio::test]
    async fn resolve_blocks_entirely_remote() {
        let f = fixture(8).await;
        f.chain.mine(4);
        let blocks = f.fetcher.resolve_blocks(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(blocks.len(), 4);
    }
}
