//! `LogPoller` — the orchestrator.
//!
//! A single control task owns the ingestion cursor and reacts to whichever
//! event is ready first: shutdown, a replay request, or one of four jittered
//! timers (main poll, backup poll, block prune, log prune). Because only that
//! task ingests, repairs or prunes, at most one such step runs at a time.
//!
//! Replay requests reach the loop through a single-slot inbox; each carries
//! its own completion channel back to the caller. Every start opens a fresh
//! inbox, and the loop closes it on exit.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy_primitives::B256;
use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ChainClient;
use crate::config::PollerConfig;
use crate::error::PollerError;
use crate::fetcher::RangeFetcher;
use crate::filter::Filter;
use crate::health::{HealthMonitor, HealthReport, PollerState};
use crate::ingest::{replay_start, Ingestor};
use crate::metrics::{MetricsSnapshot, PollerMetrics};
use crate::registry::FilterRegistry;
use crate::store::LogStore;
use crate::types::Block;

struct ReplayRequest {
    from_block: u64,
    done: oneshot::Sender<Result<(), PollerError>>,
}

type Inbox = mpsc::Receiver<ReplayRequest>;

struct Runtime {
    shutdown: CancellationToken,
    /// Sender half of the running loop's inbox. `None` while stopped.
    replay_tx: Option<mpsc::Sender<ReplayRequest>>,
    task: Option<JoinHandle<()>>,
}

/// Reorg-aware log poller for one chain.
pub struct LogPoller {
    config: PollerConfig,
    store: Arc<dyn LogStore>,
    registry: Arc<FilterRegistry>,
    fetcher: Arc<RangeFetcher>,
    ingestor: Arc<Ingestor>,
    metrics: Arc<PollerMetrics>,
    health: Arc<HealthMonitor>,
    runtime: Mutex<Runtime>,
}

impl LogPoller {
    /// Create a poller. Fails if `config` does not validate.
    pub fn new(
        config: PollerConfig,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn LogStore>,
    ) -> Result<Self, PollerError> {
        Self::with_metrics(config, client, store, Arc::new(PollerMetrics::default()))
    }

    /// Create a poller recording into a caller-owned metrics handle.
    pub fn with_metrics(
        config: PollerConfig,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn LogStore>,
        metrics: Arc<PollerMetrics>,
    ) -> Result<Self, PollerError> {
        config.validate()?;

        let registry = Arc::new(FilterRegistry::new(store.clone()));
        let fetcher = Arc::new(RangeFetcher::new(
            client.clone(),
            store.clone(),
            registry.clone(),
            metrics.clone(),
            config.backfill_batch_size,
            config.rpc_batch_size,
        ));
        let ingestor = Arc::new(Ingestor::new(
            client,
            store.clone(),
            registry.clone(),
            fetcher.clone(),
            metrics.clone(),
            config.finality_depth,
            config.backup_delay_blocks,
        ));

        Ok(Self {
            health: Arc::new(HealthMonitor::new(config.error_buffer_capacity)),
            config,
            store,
            registry,
            fetcher,
            ingestor,
            metrics,
            runtime: Mutex::new(Runtime {
                shutdown: CancellationToken::new(),
                replay_tx: None,
                task: None,
            }),
        })
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Load persisted filters and spawn the control loop.
    pub async fn start(&self) -> Result<(), PollerError> {
        self.registry.load(false).await?;

        let mut rt = self.runtime();
        if rt.task.is_some() {
            return Err(PollerError::AlreadyStarted);
        }
        let (replay_tx, inbox) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let control = ControlLoop {
            config: self.config.clone(),
            store: self.store.clone(),
            ingestor: self.ingestor.clone(),
            metrics: self.metrics.clone(),
            health: self.health.clone(),
        };
        self.health.set_state(PollerState::Running);
        rt.task = Some(tokio::spawn(control.run(inbox, shutdown.clone())));
        rt.shutdown = shutdown;
        rt.replay_tx = Some(replay_tx);

        info!(
            finality_depth = self.config.finality_depth,
            poll_interval_ms = self.config.poll_interval_ms,
            "Log poller started"
        );
        Ok(())
    }

    /// Stop the control loop and wait for it to exit. Outstanding replays
    /// fail with [`PollerError::ReplayShutdown`].
    pub async fn stop(&self) -> Result<(), PollerError> {
        let task = {
            let mut rt = self.runtime();
            let Some(task) = rt.task.take() else {
                return Err(PollerError::NotStarted);
            };
            self.health.set_state(PollerState::Stopping);
            rt.replay_tx = None;
            rt.shutdown.cancel();
            task
        };

        task.await
            .map_err(|e| PollerError::Other(format!("control loop panicked: {e}")))?;
        self.health.set_state(PollerState::Stopped);
        info!("Log poller stopped");
        Ok(())
    }

    // ─── Replay ──────────────────────────────────────────────────────────────

    /// Re-ingest from `from_block` (clamped to the latest persisted block)
    /// and wait for the result.
    ///
    /// Cancelling `token` before the loop accepts the request returns
    /// [`PollerError::ReplayAborted`]; cancelling afterwards returns
    /// [`PollerError::ReplayInProgress`] while the replay carries on.
    pub async fn replay(&self, token: &CancellationToken, from_block: u64) -> Result<(), PollerError> {
        let Some(tx) = self.runtime().replay_tx.clone() else {
            return Err(PollerError::NotStarted);
        };
        send_replay(&tx, token, from_block).await
    }

    /// Request a replay without waiting for it. Ignored, with a warning,
    /// while the poller is stopped.
    pub fn replay_async(&self, from_block: u64) {
        let Some(tx) = self.runtime().replay_tx.clone() else {
            warn!(from_block, "Async replay requested while stopped");
            return;
        };
        tokio::spawn(async move {
            let token = CancellationToken::new();
            match send_replay(&tx, &token, from_block).await {
                Ok(()) => debug!(from_block, "Async replay finished"),
                Err(e) if e.is_replay_coordination() => {
                    info!(from_block, error = %e, "Async replay not completed")
                }
                // The control loop already recorded the failure.
                Err(e) => debug!(from_block, error = %e, "Async replay failed"),
            }
        });
    }

    // ─── Filters & blocks ────────────────────────────────────────────────────

    pub async fn register_filter(&self, filter: Filter) -> Result<(), PollerError> {
        self.registry.register(filter).await
    }

    pub async fn unregister_filter(&self, name: &str) -> Result<(), PollerError> {
        self.registry.unregister(name).await
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.registry.has_filter(name)
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.registry.filters()
    }

    /// The latest persisted block.
    pub async fn latest_block(&self) -> Result<Block, PollerError> {
        self.store.latest_block().await?.ok_or(PollerError::NoBlocks)
    }

    pub async fn latest_block_number(&self) -> Result<u64, PollerError> {
        Ok(self.latest_block().await?.number)
    }

    /// Block records for `numbers`, from the store where possible and the
    /// chain otherwise.
    pub async fn get_blocks_range(&self, numbers: &[u64]) -> Result<Vec<Block>, PollerError> {
        self.fetcher.resolve_blocks(numbers).await
    }

    /// Hash of the persisted block at `number`, if any.
    pub async fn block_hash(&self, number: u64) -> Result<Option<B256>, PollerError> {
        Ok(self.store.block_by_number(number).await?.map(|b| b.hash))
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    /// Lifecycle state plus critical errors since the previous report.
    pub fn health_report(&self) -> HealthReport {
        self.health.report()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run one ingestion cycle from `current` on the caller's task.
    ///
    /// Bypasses the control loop; do not call while the poller is running.
    pub async fn poll_and_save_logs(&self, current: u64) -> Result<(), PollerError> {
        self.ingestor.poll_and_save_logs(current).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }
}

impl Drop for LogPoller {
    fn drop(&mut self) {
        self.runtime().shutdown.cancel();
    }
}

async fn send_replay(
    tx: &mpsc::Sender<ReplayRequest>,
    token: &CancellationToken,
    from_block: u64,
) -> Result<(), PollerError> {
    let (done, mut done_rx) = oneshot::channel();
    let request = ReplayRequest { from_block, done };

    tokio::select! {
        biased;
        _ = token.cancelled() => return Err(PollerError::ReplayAborted),
        sent = tx.send(request) => {
            if sent.is_err() {
                return Err(PollerError::ReplayShutdown);
            }
        }
    }

    let outcome = tokio::select! {
        result = &mut done_rx => Some(result),
        _ = token.cancelled() => None,
    };
    match outcome {
        Some(Ok(result)) => result,
        Some(Err(_)) => Err(PollerError::ReplayShutdown),
        None => {
            tokio::spawn(async move {
                match done_rx.await {
                    Ok(Ok(())) => debug!(from_block, "Unsupervised replay finished"),
                    Ok(Err(e)) => warn!(from_block, error = %e, "Unsupervised replay failed"),
                    Err(_) => debug!(from_block, "Unsupervised replay dropped at shutdown"),
                }
            });
            Err(PollerError::ReplayInProgress)
        }
    }
}

// ─── Control loop ────────────────────────────────────────────────────────────

/// `period` scaled by a random factor in `[1 - fraction, 1 + fraction]`.
fn jittered(period: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return period;
    }
    let factor = rand::thread_rng().gen_range(1.0 - fraction..=1.0 + fraction);
    period.mul_f64(factor)
}

struct ControlLoop {
    config: PollerConfig,
    store: Arc<dyn LogStore>,
    ingestor: Arc<Ingestor>,
    metrics: Arc<PollerMetrics>,
    health: Arc<HealthMonitor>,
}

impl ControlLoop {
    fn next_fire(&self, period: Duration) -> Instant {
        Instant::now() + jittered(period, self.config.jitter_fraction)
    }

    async fn run(self, mut inbox: Inbox, shutdown: CancellationToken) {
        let mut next_poll = Instant::now();
        let mut next_backup = self.next_fire(self.config.backup_poll_interval());
        let mut next_block_prune = self.next_fire(self.config.block_prune_interval());
        let mut next_log_prune = self.next_fire(self.config.log_prune_interval());
        let mut backup_cursor = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(request) = inbox.recv() => self.replay(request).await,
                _ = sleep_until(next_poll) => {
                    next_poll = self.next_fire(self.config.poll_interval());
                    self.main_poll().await;
                }
                _ = sleep_until(next_backup) => {
                    next_backup = self.next_fire(self.config.backup_poll_interval());
                    if let Err(e) = self.ingestor.backup_poll(&mut backup_cursor).await {
                        self.failed("backup poll", e);
                    }
                }
                _ = sleep_until(next_block_prune) => {
                    next_block_prune = self.next_fire(self.config.block_prune_interval());
                    self.prune_blocks().await;
                }
                _ = sleep_until(next_log_prune) => {
                    next_log_prune = self.next_fire(self.config.log_prune_interval());
                    self.prune_logs().await;
                }
            }
        }

        // Tell anyone still waiting that the loop is gone.
        inbox.close();
        while let Ok(request) = inbox.try_recv() {
            let _ = request.done.send(Err(PollerError::ReplayShutdown));
        }
        debug!("Control loop exited");
    }

    fn failed(&self, what: &str, e: PollerError) {
        self.metrics.record_poll_failure(what);
        if e.is_critical() {
            error!(task = what, error = %e, "Critical failure");
            self.health.record(&e);
        } else {
            warn!(task = what, error = %e, "Cycle failed, retrying next tick");
        }
    }

    async fn main_poll(&self) {
        let start = match self.ingestor.main_poll_start().await {
            Ok(start) => start,
            Err(e) => return self.failed("main poll", e),
        };
        if let Err(e) = self.ingestor.poll_and_save_logs(start).await {
            self.failed("main poll", e);
        }
    }

    async fn replay(&self, request: ReplayRequest) {
        let result = match self.store.latest_block().await {
            Ok(latest) => {
                let start = replay_start(request.from_block, latest.map(|b| b.number));
                info!(requested = request.from_block, start, "Replaying");
                self.ingestor.poll_and_save_logs(start).await
            }
            Err(e) => Err(e),
        };
        match &result {
            Ok(()) => self.metrics.record_replay(),
            Err(e) => self.failed("replay", e.clone()),
        }
        // The caller may have stopped waiting; that is fine.
        let _ = request.done.send(result);
    }

    async fn prune_blocks(&self) {
        let latest = match self.store.latest_block().await {
            Ok(Some(block)) => block.number,
            Ok(None) => return,
            Err(e) => return self.failed("block prune", e),
        };
        let Some(cutoff) = latest.checked_sub(self.config.keep_blocks_depth) else {
            return;
        };
        match self.store.delete_blocks_before(cutoff).await {
            Ok(removed) => {
                self.metrics.record_pruned(removed, 0);
                debug!(cutoff, removed, "Pruned old blocks");
            }
            Err(e) => self.failed("block prune", e),
        }
    }

    async fn prune_logs(&self) {
        let now = Utc::now().timestamp();
        match self
            .store
            .delete_expired_logs(now, self.config.default_log_retention())
            .await
        {
            Ok(removed) => {
                self.metrics.record_pruned(0, removed);
                debug!(removed, "Pruned expired logs");
            }
            Err(e) => self.failed("log prune", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_fraction() {
        let period = Duration::from_millis(1_000);
        for _ in 0..100 {
            let d = jittered(period, 0.1);
            assert!(d >= Duration::from_millis(899) && d <= Duration::from_millis(1_101));
        }
        assert_eq!(jittered(period, 0.0), period);
    }

    #[test]
    fn invalid_config_is_rejected() {
        use crate::memory::MemoryStore;
        use crate::sim::SimulatedChain;

        let config = PollerConfig {
            finality_depth: 10,
            keep_blocks_depth: 5,
            ..Default::default()
        };
        let result = LogPoller::new(
            config,
            Arc::new(SimulatedChain::new(1)),
            Arc::new(MemoryStore::new(1)),
        );
        assert!(matches!(result, Err(PollerError::Config(_))));
    }
}
