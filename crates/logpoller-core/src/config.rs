//! Log poller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PollerError;

/// Configuration for a log poller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Main polling period (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocks behind the remote tip beyond which a block is assumed immutable.
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    /// Initial number of blocks per backfill `eth_getLogs` call.
    /// Shrinks (halving) when the provider reports a result limit.
    #[serde(default = "default_backfill_batch_size")]
    pub backfill_batch_size: u64,
    /// Number of header lookups per batched RPC call.
    #[serde(default = "default_rpc_batch_size")]
    pub rpc_batch_size: usize,
    /// Blocks retained behind the latest persisted block before pruning.
    /// Must exceed `finality_depth`.
    #[serde(default = "default_keep_blocks_depth")]
    pub keep_blocks_depth: u64,
    /// Backup poll runs every `backup_poll_factor` main poll periods.
    #[serde(default = "default_backup_poll_factor")]
    pub backup_poll_factor: u32,
    /// How far behind the last persisted block the backup poller starts.
    #[serde(default = "default_backup_delay_blocks")]
    pub backup_delay_blocks: u64,
    /// Block pruning runs every `block_prune_factor` poll periods.
    #[serde(default = "default_block_prune_factor")]
    pub block_prune_factor: u32,
    /// Log pruning runs every `log_prune_factor` poll periods.
    /// Keep co-prime with `block_prune_factor`.
    #[serde(default = "default_log_prune_factor")]
    pub log_prune_factor: u32,
    /// Retention for logs whose filters do not set one (seconds, 0 = forever).
    #[serde(default)]
    pub default_log_retention_secs: u64,
    /// Timers fire at `period * (1 ± jitter_fraction)`.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Critical errors held for health reporting.
    #[serde(default = "default_error_buffer_capacity")]
    pub error_buffer_capacity: usize,
}

fn default_poll_interval_ms() -> u64 { 15_000 }
fn default_finality_depth() -> u64 { 50 }
fn default_backfill_batch_size() -> u64 { 1_000 }
fn default_rpc_batch_size() -> usize { 100 }
fn default_keep_blocks_depth() -> u64 { 2_000 }
fn default_backup_poll_factor() -> u32 { 100 }
fn default_backup_delay_blocks() -> u64 { 100 }
fn default_block_prune_factor() -> u32 { 1_000 }
fn default_log_prune_factor() -> u32 { 2_401 }
fn default_jitter_fraction() -> f64 { 0.1 }
fn default_error_buffer_capacity() -> usize { 32 }

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            finality_depth: default_finality_depth(),
            backfill_batch_size: default_backfill_batch_size(),
            rpc_batch_size: default_rpc_batch_size(),
            keep_blocks_depth: default_keep_blocks_depth(),
            backup_poll_factor: default_backup_poll_factor(),
            backup_delay_blocks: default_backup_delay_blocks(),
            block_prune_factor: default_block_prune_factor(),
            log_prune_factor: default_log_prune_factor(),
            default_log_retention_secs: 0,
            jitter_fraction: default_jitter_fraction(),
            error_buffer_capacity: default_error_buffer_capacity(),
        }
    }
}

impl PollerConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(s: &str) -> Result<Self, PollerError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| PollerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the poller cannot run correctly with.
    pub fn validate(&self) -> Result<(), PollerError> {
        if self.poll_interval_ms == 0 {
            return Err(PollerError::Config("poll_interval_ms must be positive".into()));
        }
        if self.backfill_batch_size == 0 {
            return Err(PollerError::Config("backfill_batch_size must be positive".into()));
        }
        if self.rpc_batch_size == 0 {
            return Err(PollerError::Config("rpc_batch_size must be positive".into()));
        }
        if self.backup_poll_factor == 0 || self.block_prune_factor == 0 || self.log_prune_factor == 0 {
            return Err(PollerError::Config("timer factors must be positive".into()));
        }
        // The oldest retained block must still be comparable against a
        // reorg at the finality boundary.
        if self.keep_blocks_depth <= self.finality_depth {
            return Err(PollerError::Config(format!(
                "keep_blocks_depth ({}) must exceed finality_depth ({})",
                self.keep_blocks_depth, self.finality_depth
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(PollerError::Config("jitter_fraction must be in [0, 1)".into()));
        }
        if self.error_buffer_capacity == 0 {
            return Err(PollerError::Config("error_buffer_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backup_poll_interval(&self) -> Duration {
        self.poll_interval() * self.backup_poll_factor
    }

    pub fn block_prune_interval(&self) -> Duration {
        self.poll_interval() * self.block_prune_factor
    }

    pub fn log_prune_interval(&self) -> Duration {
        self.poll_interval() * self.log_prune_factor
    }

    pub fn default_log_retention(&self) -> Duration {
        Duration::from_secs(self.default_log_retention_secs)
    }
}
