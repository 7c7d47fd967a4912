//! Poller metrics.
//!
//! Instruments follow OpenTelemetry conventions and are built from a
//! caller-supplied [`Meter`], so they can be exported via OTLP like any
//! other service metric. Without a meter, the global one is used (a no-op
//! until an exporter is installed).
//!
//! Every instrument also keeps an in-process total, read together through
//! [`PollerMetrics::snapshot`] for health endpoints and tests.

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use serde::Serialize;

/// Meter name used when no meter is injected.
pub const METER_NAME: &str = "logpoller";

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub blocks_processed: u64,
    pub logs_inserted: u64,
    pub logs_backfilled: u64,
    pub reorgs: u64,
    pub deepest_reorg: u64,
    pub poll_failures: u64,
    pub replays_completed: u64,
    pub blocks_pruned: u64,
    pub logs_pruned: u64,
    pub batch_shrinks: u64,
}

/// A counter plus its running total.
struct Tracked {
    counter: Counter<u64>,
    total: AtomicU64,
}

impl Tracked {
    fn new(meter: &Meter, name: &'static str, description: &'static str) -> Self {
        Self {
            counter: meter.u64_counter(name).with_description(description).init(),
            total: AtomicU64::new(0),
        }
    }

    fn add(&self, n: u64, attributes: &[KeyValue]) {
        self.counter.add(n, attributes);
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Central metrics handle for a log poller.
///
/// One handle is created per poller and shared (via `Arc`) with the
/// components that record into it.
pub struct PollerMetrics {
    blocks_processed: Tracked,
    logs_inserted: Tracked,
    logs_backfilled: Tracked,
    reorgs: Tracked,
    reorg_depth: Histogram<u64>,
    deepest_reorg: AtomicU64,
    poll_failures: Tracked,
    replays_completed: Tracked,
    blocks_pruned: Tracked,
    logs_pruned: Tracked,
    batch_shrinks: Tracked,
}

impl PollerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            blocks_processed: Tracked::new(
                meter,
                "logpoller.blocks_processed",
                "Unfinalized blocks committed by ingestion",
            ),
            logs_inserted: Tracked::new(
                meter,
                "logpoller.logs_inserted",
                "Logs committed together with their block",
            ),
            logs_backfilled: Tracked::new(
                meter,
                "logpoller.logs_backfilled",
                "Logs committed by finalized-range backfill",
            ),
            reorgs: Tracked::new(meter, "logpoller.reorgs", "Reorgs detected and repaired"),
            reorg_depth: meter
                .u64_histogram("logpoller.reorg_depth")
                .with_description("Blocks rolled back per reorg")
                .init(),
            deepest_reorg: AtomicU64::new(0),
            poll_failures: Tracked::new(
                meter,
                "logpoller.poll_failures",
                "Control-loop steps that ended in an error",
            ),
            replays_completed: Tracked::new(
                meter,
                "logpoller.replays_completed",
                "Replay requests that finished successfully",
            ),
            blocks_pruned: Tracked::new(
                meter,
                "logpoller.blocks_pruned",
                "Block records removed by the block pruner",
            ),
            logs_pruned: Tracked::new(
                meter,
                "logpoller.logs_pruned",
                "Logs removed by retention",
            ),
            batch_shrinks: Tracked::new(
                meter,
                "logpoller.batch_shrinks",
                "Backfill batch halvings after a provider result limit",
            ),
        }
    }

    /// An unfinalized block and its logs were committed.
    pub fn record_block(&self, logs: usize) {
        self.blocks_processed.add(1, &[]);
        self.logs_inserted.add(logs as u64, &[]);
    }

    pub fn record_backfilled(&self, logs: usize) {
        self.logs_backfilled.add(logs as u64, &[]);
    }

    pub fn record_reorg(&self, depth: u64) {
        self.reorgs.add(1, &[]);
        self.reorg_depth.record(depth, &[]);
        self.deepest_reorg.fetch_max(depth, Ordering::Relaxed);
    }

    /// A control-loop step failed. `task` names the step, e.g. `"main poll"`.
    pub fn record_poll_failure(&self, task: &str) {
        self.poll_failures
            .add(1, &[KeyValue::new("task", task.to_string())]);
    }

    pub fn record_replay(&self) {
        self.replays_completed.add(1, &[]);
    }

    pub fn record_pruned(&self, blocks: u64, logs: u64) {
        self.blocks_pruned.add(blocks, &[]);
        self.logs_pruned.add(logs, &[]);
    }

    pub fn record_batch_shrink(&self) {
        self.batch_shrinks.add(1, &[]);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_processed: self.blocks_processed.get(),
            logs_inserted: self.logs_inserted.get(),
            logs_backfilled: self.logs_backfilled.get(),
            reorgs: self.reorgs.get(),
            deepest_reorg: self.deepest_reorg.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.get(),
            replays_completed: self.replays_completed.get(),
            blocks_pruned: self.blocks_pruned.get(),
            logs_pruned: self.logs_pruned.get(),
            batch_shrinks: self.batch_shrinks.get(),
        }
    }
}

impl Default for PollerMetrics {
    /// Instruments on the global meter provider.
    fn default() -> Self {
        Self::new(&global::meter(METER_NAME))
    }
}
