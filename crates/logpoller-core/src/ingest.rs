//! The ingestion routine shared by main polls and replays, plus the backup
//! poll that re-reads a trailing finalized window.
//!
//! # Cycle
//! 1. Read the remote head. Nothing to do if the cursor is above it.
//! 2. Resolve reorgs at the cursor (may move it back).
//! 3. Backfill everything already past finality in bulk.
//! 4. Walk the remaining unfinalized blocks one by one: logs by block hash,
//!    then block row and logs in a single commit, re-checking for a reorg
//!    before each block.
//!
//! Every durable step is one commit, so a failed cycle leaves the store at a
//! well-defined frontier and the next cycle resumes from it.

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::ChainClient;
use crate::error::PollerError;
use crate::fetcher::RangeFetcher;
use crate::metrics::PollerMetrics;
use crate::registry::FilterRegistry;
use crate::reorg::ReorgResolver;
use crate::store::{LogStore, WriteBatch};
use crate::types::Header;

/// Runs ingestion cycles. Owned by the control loop; never run concurrently.
pub struct Ingestor {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn LogStore>,
    registry: Arc<FilterRegistry>,
    resolver: ReorgResolver,
    fetcher: Arc<RangeFetcher>,
    metrics: Arc<PollerMetrics>,
    finality_depth: u64,
    backup_delay: u64,
}

impl Ingestor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn LogStore>,
        registry: Arc<FilterRegistry>,
        fetcher: Arc<RangeFetcher>,
        metrics: Arc<PollerMetrics>,
        finality_depth: u64,
        backup_delay: u64,
    ) -> Self {
        Self {
            resolver: ReorgResolver::new(client.clone(), store.clone(), finality_depth),
            client,
            store,
            registry,
            fetcher,
            metrics,
            finality_depth,
            backup_delay,
        }
    }

    async fn latest_remote(&self) -> Result<Header, PollerError> {
        self.client
            .header_by_number(None)
            .await?
            .ok_or(PollerError::MissingLatestHeader)
    }

    /// Where the main poll resumes: one past the latest persisted block, or
    /// `finality_depth` behind the remote head on a fresh store.
    pub async fn main_poll_start(&self) -> Result<u64, PollerError> {
        if let Some(block) = self.store.latest_block().await? {
            return Ok(block.number + 1);
        }
        let latest = self.latest_remote().await?.number;
        if latest < self.finality_depth {
            return Err(PollerError::ChainTooShort {
                latest,
                finality_depth: self.finality_depth,
            });
        }
        Ok(latest - self.finality_depth)
    }

    /// Ingest from `current` up to the remote head.
    pub async fn poll_and_save_logs(&self, current: u64) -> Result<(), PollerError> {
        let latest = self.latest_remote().await?.number;
        if current > latest {
            debug!(current, latest, "Cursor ahead of remote head, waiting");
            return Ok(());
        }

        let resolved = self.resolver.resolve(current, None).await?;
        if let Some(reorg) = &resolved.reorg {
            self.metrics.record_reorg(reorg.depth);
        }
        let mut current = resolved.header.number;
        let mut pending = Some(resolved.header);

        if let Some(last_final) = latest.checked_sub(self.finality_depth + 1) {
            if last_final >= current {
                self.fetcher.backfill(current, last_final).await?;
                current = last_final + 1;
                pending = None;
            }
        }

        while current <= latest {
            let resolved = self.resolver.resolve(current, pending.take()).await?;
            if let Some(reorg) = &resolved.reorg {
                self.metrics.record_reorg(reorg.depth);
            }
            let header = resolved.header;

            let query = self.registry.effective_query().as_ref().clone().at_block_hash(header.hash);
            let mut logs = self.client.filter_logs(&query).await?;
            for log in &mut logs {
                log.block_timestamp = header.timestamp;
            }
            let count = logs.len();

            self.store
                .commit(
                    WriteBatch::new()
                        .insert_block(header.to_block(self.client.chain_id()))
                        .insert_logs(logs),
                )
                .await?;
            self.metrics.record_block(count);
            debug!(number = header.number, hash = %header.hash, logs = count, "Saved block");

            current = header.number + 1;
        }
        Ok(())
    }

    /// Re-read the trailing finalized window to patch provider gaps.
    ///
    /// `cursor` is the backup poller's own position; it is seeded on first
    /// use and only moves forward afterwards.
    pub async fn backup_poll(&self, cursor: &mut Option<u64>) -> Result<(), PollerError> {
        let Some(persisted) = self.store.latest_block().await? else {
            debug!("Nothing persisted yet, skipping backup poll");
            return Ok(());
        };
        let latest = self.latest_remote().await?.number;
        let Some(end) = latest.checked_sub(self.finality_depth + 1) else {
            return Ok(());
        };

        let start = *cursor.get_or_insert_with(|| {
            let lag = (self.finality_depth + 1).max(self.backup_delay);
            persisted.number.saturating_sub(lag)
        });
        if start > end {
            debug!(start, end, "Backup poll has nothing finalized to re-read");
            return Ok(());
        }

        info!(start, end, "Backup poll");
        self.fetcher.backfill(start, end).await?;
        *cursor = Some(end + 1);
        Ok(())
    }
}

/// Effective replay start: never later than the latest persisted block.
pub fn replay_start(requested: u64, latest_persisted: Option<u64>) -> u64 {
    match latest_persisted {
        Some(persisted) => requested.min(persisted),
        None => requested,
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
        ingestor: Ingestor,
        metrics: Arc<PollerMetrics>,
    }

    async fn fixture(finality: u64) -> Fixture {
        let chain = Arc::new(SimulatedChain::new(1));
        let store = Arc::new(MemoryStore::new(1));
        let registry = Arc::new(FilterRegistry::new(store.clone()));
        registry
            .register(Filter::new("f").event(sig()).address(addr()))
            .await
            .unwrap();
        let metrics = Arc::new(PollerMetrics::default());
        let fetcher = Arc::new(RangeFetcher::new(
            chain.clone(),
            store.clone(),
            registry.clone(),
            metrics.clone(),
            100,
            10,
        ));
        let ingestor = Ingestor::new(
            chain.clone(),
            store.clone(),
            registry,
            fetcher,
            metrics.clone(),
            finality,
            4,
        );
        Fixture { chain, store, ingestor, metrics }
    }

    /// A provider that knows no headers at all.
    struct EmptyChain;

    #[async_trait::async_trait]
    impl ChainClient for EmptyChain {
        fn chain_id(&self) -> u64 {
            1
        }

        async fn header_by_number(&self, _: Option<u64>) -> Result<Option<Header>, PollerError> {
            Ok(None)
        }

        async fn header_by_hash(&self, _: B256) -> Result<Option<Header>, PollerError> {
            Ok(None)
        }

        async fn filter_logs(
            &self,
            _: &crate::client::LogFilterQuery,
        ) -> Result<Vec<crate::types::Log>, PollerError> {
            Ok(vec![])
        }

        async fn batch_headers(&self, numbers: &[u64]) -> Result<Vec<Option<Header>>, PollerError> {
            Ok(vec![None; numbers.len()])
        }
    }

    #[tokio::test]
    async fn missing_latest_header_is_named() {
        let client: Arc<dyn ChainClient> = Arc::new(EmptyChain);
        let store = Arc::new(MemoryStore::new(1));
        let registry = Arc::new(FilterRegistry::new(store.clone()));
        let metrics = Arc::new(PollerMetrics::default());
        let fetcher = Arc::new(RangeFetcher::new(
            client.clone(),
            store.clone(),
            registry.clone(),
            metrics.clone(),
            100,
            10,
        ));
        let ingestor = Ingestor::new(client, store, registry, fetcher, metrics, 3, 4);

        let err = ingestor.main_poll_start().await.unwrap_err();
        assert!(matches!(err, PollerError::MissingLatestHeader));
        let err = ingestor.poll_and_save_logs(1).await.unwrap_err();
        assert!(matches!(err, PollerError::MissingLatestHeader));
    }

    #[test]
    fn replay_start_clamps_to_persisted() {
        assert_eq!(replay_start(100, Some(80)), 80);
        assert_eq!(replay_start(50, Some(80)), 50);
        assert_eq!(replay_start(50, None), 50);
    }

    #[tokio::test]
    async fn fresh_start_is_finality_behind_head() {
        let f = fixture(5).await;
        f.chain.mine(20);
        assert_eq!(f.ingestor.main_poll_start().await.unwrap(), 15);
    }

    #[tokio::test]
    async fn fresh_start_refuses_short_chain() {
        let f = fixture(5).await;
        f.chain.mine(3);
        let err = f.ingestor.main_poll_start().await.unwrap_err();
        assert!(matches!(err, PollerError::ChainTooShort { latest: 3, finality_depth: 5 }));
    }

    #[tokio::test]
    async fn cycle_backfills_then_walks_unfinalized() {
        let f = fixture(3).await;
        f.chain.mine(20);
        for n in [5, 15, 18, 20] {
            f.chain.emit(n, addr(), sig(), vec![], vec![]).unwrap();
        }

        f.ingestor.poll_and_save_logs(5).await.unwrap();

        let numbers: Vec<u64> = f.store.all_logs().iter().map(|l| l.block_number).collect();
        assert_eq!(numbers, vec![5, 15, 18, 20]);
        // Only the unfinalized tail gets block rows: 17..=20.
        let blocks = f.store.blocks_range(0, 100).await.unwrap();
        assert_eq!(blocks.first().unwrap().number, 17);
        assert_eq!(blocks.last().unwrap().number, 20);
        assert_eq!(f.metrics.snapshot().blocks_processed, 4);
    }

    #[tokio::test]
    async fn frontier_advances_by_blocks_processed() {
        let f = fixture(3).await;
        f.chain.mine(10);
        f.ingestor.poll_and_save_logs(f.ingestor.main_poll_start().await.unwrap()).await.unwrap();
        assert_eq!(f.store.latest_block().await.unwrap().unwrap().number, 10);

        f.chain.mine(2);
        let start = f.ingestor.main_poll_start().await.unwrap();
        assert_eq!(start, 11);
        f.ingestor.poll_and_save_logs(start).await.unwrap();
        assert_eq!(f.store.latest_block().await.unwrap().unwrap().number, 12);
    }

    #[tokio::test]
    async fn cursor_above_head_is_noop() {
        let f = fixture(3).await;
        f.chain.mine(5);
        f.ingestor.poll_and_save_logs(9).await.unwrap();
        assert!(f.store.latest_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reorg_mid_cycle_replaces_orphaned_logs() {
        let f = fixture(5).await;
        f.chain.mine(10);
        f.chain.emit(9, addr(), sig(), vec![], vec![]).unwrap();
        f.ingestor.poll_and_save_logs(5).await.unwrap();
        let orphaned = f.chain.header(9).unwrap().hash;

        f.chain.fork_at(8);
        f.chain.mine(4);
        f.chain.emit(9, addr(), sig(), vec![B256::repeat_byte(1)], vec![]).unwrap();
        f.ingestor.poll_and_save_logs(11).await.unwrap();

        let logs = f.store.all_logs();
        assert_eq!(logs.len(), 1);
        assert_ne!(logs[0].block_hash, orphaned);
        assert_eq!(
            f.store.block_by_number(9).await.unwrap().unwrap().hash,
            f.chain.header(9).unwrap().hash
        );
        assert_eq!(f.metrics.snapshot().reorgs, 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_frontier_unchanged() {
        let f = fixture(3).await;
        f.chain.mine(10);
        f.ingestor.poll_and_save_logs(7).await.unwrap();

        f.chain.mine(1);
        f.chain.emit(11, addr(), sig(), vec![], vec![]).unwrap();
        f.store.fail_writes(true);
        assert!(f.ingestor.poll_and_save_logs(11).await.is_err());
        assert_eq!(f.store.latest_block().await.unwrap().unwrap().number, 10);
        assert_eq!(f.store.log_count(), 0);
    }

    #[tokio::test]
    async fn backup_poll_patches_missed_logs() {
        let f = fixture(3).await;
        f.chain.mine(20);
        f.ingestor.poll_and_save_logs(10).await.unwrap();

        // A log the provider did not serve during the main poll.
        f.chain.emit(12, addr(), sig(), vec![], vec![]).unwrap();
        f.chain.mine(10);

        let mut cursor = None;
        f.ingestor.backup_poll(&mut cursor).await.unwrap();
        // persisted 20, lag max(3 + 1, 4) = 4 -> start 16; head 30 -> end 26
        assert_eq!(cursor, Some(27));
        assert_eq!(f.store.log_count(), 0);

        let mut cursor = Some(10);
        f.ingestor.backup_poll(&mut cursor).await.unwrap();
        assert_eq!(f.store.log_count(), 1);
    }
}
