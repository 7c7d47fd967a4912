//! Fluent builder API for creating log pollers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use alloy_primitives::{address, b256};
//! use logpoller_core::{Filter, MemoryStore};
//! use logpoller_evm::{EvmChainClient, PollerBuilder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = EvmChainClient::http("http://localhost:8545", 1, Duration::from_secs(30))?;
//! let poller = PollerBuilder::new()
//!     .finality_depth(64)
//!     .poll_interval_ms(12_000)
//!     .backfill_batch_size(500)
//!     .filter(
//!         Filter::new("usdc-transfers")
//!             .event(b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"))
//!             .address(address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")),
//!     )
//!     .build(Arc::new(client), Arc::new(MemoryStore::new(1)))
//!     .await?;
//! poller.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use logpoller_core::client::ChainClient;
use logpoller_core::config::PollerConfig;
use logpoller_core::error::PollerError;
use logpoller_core::filter::Filter;
use logpoller_core::metrics::PollerMetrics;
use logpoller_core::poller::LogPoller;
use logpoller_core::store::LogStore;

/// Fluent builder for `PollerConfig` and `LogPoller`.
#[derive(Default)]
pub struct PollerBuilder {
    config: PollerConfig,
    filters: Vec<Filter>,
    metrics: Option<Arc<PollerMetrics>>,
}

impl PollerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: PollerConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Set the main polling period in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the depth behind the remote tip past which blocks are final.
    pub fn finality_depth(mut self, depth: u64) -> Self {
        self.config.finality_depth = depth;
        self
    }

    /// Set the initial number of blocks per backfill `eth_getLogs` call.
    pub fn backfill_batch_size(mut self, size: u64) -> Self {
        self.config.backfill_batch_size = size;
        self
    }

    /// Set the number of header lookups per batched RPC call.
    pub fn rpc_batch_size(mut self, size: usize) -> Self {
        self.config.rpc_batch_size = size;
        self
    }

    pub fn keep_blocks_depth(mut self, depth: u64) -> Self {
        self.config.keep_blocks_depth = depth;
        self
    }

    /// Run the backup poll every `factor` main poll periods, starting
    /// `delay_blocks` behind the last persisted block.
    pub fn backup_poll(mut self, factor: u32, delay_blocks: u64) -> Self {
        self.config.backup_poll_factor = factor;
        self.config.backup_delay_blocks = delay_blocks;
        self
    }

    /// Set block and log pruning periods, in poll periods.
    pub fn prune_factors(mut self, blocks: u32, logs: u32) -> Self {
        self.config.block_prune_factor = blocks;
        self.config.log_prune_factor = logs;
        self
    }

    /// Retention for logs whose filters do not set one (0 = forever).
    pub fn default_log_retention_secs(mut self, secs: u64) -> Self {
        self.config.default_log_retention_secs = secs;
        self
    }

    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.config.jitter_fraction = fraction;
        self
    }

    pub fn error_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.error_buffer_capacity = capacity;
        self
    }

    /// Register `filter` when the poller is built.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Record into a caller-owned metrics handle.
    pub fn metrics(mut self, metrics: Arc<PollerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate and return the `PollerConfig`.
    pub fn build_config(&self) -> Result<PollerConfig, PollerError> {
        self.config.validate()?;
        Ok(self.config.clone())
    }

    /// Create the poller and register every queued filter.
    pub async fn build(
        self,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn LogStore>,
    ) -> Result<LogPoller, PollerError> {
        let config = self.build_config()?;
        let metrics = self.metrics.unwrap_or_default();
        let poller = LogPoller::with_metrics(config, client, store, metrics)?;
        for filter in self.filters {
            poller.register_filter(filter).await?;
        }
        Ok(poller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};
    use logpoller_core::{MemoryStore, SimulatedChain};

    #[test]
    fn builder_defaults() {
        let cfg = PollerBuilder::new().build_config().unwrap();
        assert_eq!(cfg.finality_depth, 50);
        assert_eq!(cfg.backfill_batch_size, 1_000);
        assert_eq!(cfg.poll_interval_ms, 15_000);
    }

    #[test]
    fn builder_custom() {
        let cfg = PollerBuilder::new()
            .finality_depth(10)
            .keep_blocks_depth(20)
            .backup_poll(5, 30)
            .prune_factors(7, 11)
            .build_config()
            .unwrap();
        assert_eq!(cfg.finality_depth, 10);
        assert_eq!(cfg.keep_blocks_depth, 20);
        assert_eq!((cfg.backup_poll_factor, cfg.backup_delay_blocks), (5, 30));
        assert_eq!((cfg.block_prune_factor, cfg.log_prune_factor), (7, 11));
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let err = PollerBuilder::new()
            .finality_depth(100)
            .keep_blocks_depth(100)
            .build_config()
            .unwrap_err();
        assert!(matches!(err, PollerError::Config(_)));
    }

    #[tokio::test]
    async fn build_registers_filters() {
        let store = Arc::new(MemoryStore::new(1));
        let poller = PollerBuilder::new()
            .filter(
                Filter::new("transfers")
                    .event(B256::repeat_byte(0xee))
                    .address(Address::repeat_byte(0xaa)),
            )
            .build(Arc::new(SimulatedChain::new(1)), store.clone())
            .await
            .unwrap();
        assert!(poller.has_filter("transfers"));
        assert!(store.load_filters().await.unwrap().contains_key("transfers"));
    }

    #[tokio::test]
    async fn build_rejects_invalid_filter() {
        let result = PollerBuilder::new()
            .filter(Filter::new("empty"))
            .build(Arc::new(SimulatedChain::new(1)), Arc::new(MemoryStore::new(1)))
            .await;
        assert!(matches!(result, Err(PollerError::InvalidFilter(_))));
    }
}
