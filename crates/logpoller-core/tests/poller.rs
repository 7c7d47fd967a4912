//! End-to-end tests of the control loop against `MemoryStore` and
//! `SimulatedChain`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use logpoller_core::{
    Block, ChainClient, Filter, Header, Log, LogFilterQuery, LogPoller, LogStore, MemoryStore,
    PollerConfig, PollerError, PollerState, SimulatedChain, WriteBatch,
};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

fn sig() -> B256 {
    B256::repeat_byte(0xee)
}

fn addr() -> Address {
    Address::repeat_byte(0x11)
}

fn config(finality_depth: u64, poll_interval_ms: u64) -> PollerConfig {
    PollerConfig {
        poll_interval_ms,
        finality_depth,
        keep_blocks_depth: finality_depth + 100,
        jitter_fraction: 0.0,
        ..Default::default()
    }
}

async fn poller(
    config: PollerConfig,
    chain: Arc<dyn ChainClient>,
    store: Arc<MemoryStore>,
) -> Arc<LogPoller> {
    let poller = LogPoller::new(config, chain, store).unwrap();
    poller
        .register_filter(Filter::new("transfers").event(sig()).address(addr()))
        .await
        .unwrap();
    Arc::new(poller)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Delays header lookups so ingestion cycles take a while.
struct SlowChain {
    inner: Arc<SimulatedChain>,
    delay: Duration,
}

#[async_trait]
impl ChainClient for SlowChain {
    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Option<Header>, PollerError> {
        sleep(self.delay).await;
        self.inner.header_by_number(number).await
    }

    async fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, PollerError> {
        self.inner.header_by_hash(hash).await
    }

    async fn filter_logs(&self, query: &LogFilterQuery) -> Result<Vec<Log>, PollerError> {
        self.inner.filter_logs(query).await
    }

    async fn batch_headers(&self, numbers: &[u64]) -> Result<Vec<Option<Header>>, PollerError> {
        self.inner.batch_headers(numbers).await
    }
}

#[tokio::test]
async fn start_stop_lifecycle() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(10);
    let p = poller(config(3, 20), chain, Arc::new(MemoryStore::new(1))).await;

    assert_eq!(p.health_report().state, PollerState::Idle);
    p.start().await.unwrap();
    assert!(p.health_report().ready);
    assert!(matches!(p.start().await, Err(PollerError::AlreadyStarted)));

    p.stop().await.unwrap();
    let report = p.health_report();
    assert_eq!(report.state, PollerState::Stopped);
    assert!(!report.ready);
    assert!(matches!(p.stop().await, Err(PollerError::NotStarted)));

    // Restartable after a clean stop.
    p.start().await.unwrap();
    p.stop().await.unwrap();
}

#[tokio::test]
async fn follows_the_head() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(20);
    chain.emit(18, addr(), sig(), vec![], vec![]).unwrap();
    let store = Arc::new(MemoryStore::new(1));
    let p = poller(config(3, 20), chain.clone(), store.clone()).await;
    p.start().await.unwrap();

    let pr = &p;
    eventually("block 20", move || async move { pr.latest_block_number().await.ok() == Some(20) }).await;
    // Fresh store starts finality depth behind the head.
    assert!(store.block_by_number(16).await.unwrap().is_none());
    assert!(store.block_by_number(17).await.unwrap().is_some());

    // Paused so the new log exists before its block is first polled.
    p.stop().await.unwrap();
    chain.mine(5);
    chain.emit(23, addr(), sig(), vec![], vec![]).unwrap();
    p.start().await.unwrap();
    eventually("block 25", move || async move { pr.latest_block_number().await.ok() == Some(25) }).await;

    let numbers: Vec<u64> = store.all_logs().iter().map(|l| l.block_number).collect();
    assert_eq!(numbers, vec![18, 23]);
    assert!(p.metrics().blocks_processed >= 8);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn replay_start_is_clamped_to_persisted() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(80);
    let store = Arc::new(MemoryStore::new(1));
    // Long interval: only the immediate first poll runs.
    let p = poller(config(3, 600_000), chain.clone(), store.clone()).await;
    p.start().await.unwrap();
    let pr = &p;
    eventually("block 80", move || async move { pr.latest_block_number().await.ok() == Some(80) }).await;

    // Logs the provider did not serve the first time around.
    chain.emit(80, addr(), sig(), vec![], vec![]).unwrap();
    chain.emit(60, addr(), sig(), vec![], vec![]).unwrap();
    let token = CancellationToken::new();

    // Requested 100, persisted 80: starts at 80 and picks up the late log.
    p.replay(&token, 100).await.unwrap();
    let numbers: Vec<u64> = store.all_logs().iter().map(|l| l.block_number).collect();
    assert_eq!(numbers, vec![80]);

    // Requested 50 is below the frontier and used as-is.
    p.replay(&token, 50).await.unwrap();
    let numbers: Vec<u64> = store.all_logs().iter().map(|l| l.block_number).collect();
    assert_eq!(numbers, vec![60, 80]);

    assert_eq!(p.metrics().replays_completed, 2);
    assert_eq!(p.latest_block_number().await.unwrap(), 80);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn replay_works_after_restart() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(20);
    let store = Arc::new(MemoryStore::new(1));
    let p = poller(config(3, 600_000), chain.clone(), store.clone()).await;
    p.start().await.unwrap();
    let pr = &p;
    eventually("block 20", move || async move { pr.latest_block_number().await.ok() == Some(20) }).await;

    let token = CancellationToken::new();
    chain.emit(18, addr(), sig(), vec![], vec![]).unwrap();
    p.replay(&token, 18).await.unwrap();

    p.stop().await.unwrap();
    p.start().await.unwrap();

    chain.emit(19, addr(), sig(), vec![], vec![]).unwrap();
    p.replay(&token, 18).await.unwrap();
    let numbers: Vec<u64> = store.all_logs().iter().map(|l| l.block_number).collect();
    assert_eq!(numbers, vec![18, 19]);
    assert_eq!(p.metrics().replays_completed, 2);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn async_replay_is_picked_up() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(20);
    let store = Arc::new(MemoryStore::new(1));
    let p = poller(config(3, 600_000), chain.clone(), store.clone()).await;

    // Ignored while stopped.
    p.replay_async(1);
    p.start().await.unwrap();
    let pr = &p;
    let st = &store;
    eventually("block 20", move || async move { pr.latest_block_number().await.ok() == Some(20) }).await;

    chain.emit(12, addr(), sig(), vec![], vec![]).unwrap();
    p.replay_async(12);
    eventually("first async replay", move || async move {
        pr.metrics().replays_completed == 1 && st.log_count() == 1
    })
    .await;

    p.stop().await.unwrap();
    p.start().await.unwrap();

    chain.emit(13, addr(), sig(), vec![], vec![]).unwrap();
    p.replay_async(12);
    eventually("async replay after restart", move || async move {
        pr.metrics().replays_completed == 2 && st.log_count() == 2
    })
    .await;
    let numbers: Vec<u64> = store.all_logs().iter().map(|l| l.block_number).collect();
    assert_eq!(numbers, vec![12, 13]);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn replay_requires_running_poller() {
    let chain = Arc::new(SimulatedChain::new(1));
    let p = poller(config(3, 20), chain, Arc::new(MemoryStore::new(1))).await;
    let err = p.replay(&CancellationToken::new(), 1).await.unwrap_err();
    assert!(matches!(err, PollerError::NotStarted));
}

#[tokio::test]
async fn replay_cancelled_before_acceptance_is_aborted() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(10);
    let p = poller(config(3, 600_000), chain, Arc::new(MemoryStore::new(1))).await;
    p.start().await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let err = p.replay(&token, 5).await.unwrap_err();
    assert!(matches!(err, PollerError::ReplayAborted));
    p.stop().await.unwrap();
    assert_eq!(p.metrics().replays_completed, 0);
}

#[tokio::test]
async fn replay_cancelled_after_acceptance_keeps_running() {
    let sim = Arc::new(SimulatedChain::new(1));
    sim.mine(10);
    let slow = Arc::new(SlowChain { inner: sim, delay: Duration::from_millis(50) });
    let p = poller(config(3, 600_000), slow, Arc::new(MemoryStore::new(1))).await;
    p.start().await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });
    let err = p.replay(&token, 7).await.unwrap_err();
    assert!(matches!(err, PollerError::ReplayInProgress));

    let pr = &p;
    eventually("background replay", move || async move { pr.metrics().replays_completed == 1 }).await;
    p.stop().await.unwrap();
}

#[tokio::test]
async fn outstanding_replay_fails_on_shutdown() {
    let sim = Arc::new(SimulatedChain::new(1));
    sim.mine(2);
    let slow = Arc::new(SlowChain { inner: sim, delay: Duration::from_millis(150) });
    let p = poller(config(1, 600_000), slow, Arc::new(MemoryStore::new(1))).await;
    p.start().await.unwrap();

    // The first main poll is still running when the replay is queued.
    sleep(Duration::from_millis(50)).await;
    let waiter = p.clone();
    let replay = tokio::spawn(async move { waiter.replay(&CancellationToken::new(), 1).await });
    sleep(Duration::from_millis(50)).await;

    p.stop().await.unwrap();
    let err = replay.await.unwrap().unwrap_err();
    assert!(matches!(err, PollerError::ReplayShutdown));
}

#[tokio::test]
async fn reorg_is_repaired_while_running() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(10);
    chain.emit(8, addr(), sig(), vec![], vec![]).unwrap();
    chain.emit(9, addr(), sig(), vec![], vec![]).unwrap();
    let store = Arc::new(MemoryStore::new(1));
    let p = poller(config(5, 20), chain.clone(), store.clone()).await;
    p.start().await.unwrap();

    let st = &store;
    eventually("initial logs", move || async move { st.log_count() == 2 }).await;
    let old_8 = chain.header(8).unwrap().hash;
    let old_9 = chain.header(9).unwrap().hash;

    // 1..7 <- 8' <- 9' <- ... <- 12'
    p.stop().await.unwrap();
    chain.fork_at(7);
    chain.mine(5);
    chain.emit(8, addr(), sig(), vec![], vec![]).unwrap();
    let new_8 = chain.header(8).unwrap().hash;
    p.start().await.unwrap();

    let pr = &p;
    eventually("repaired chain", move || async move {
        pr.latest_block_number().await.ok() == Some(12)
            && pr.block_hash(8).await.ok().flatten() == Some(new_8)
    })
    .await;
    eventually("new log", move || async move { st.log_count() == 1 }).await;

    let logs = store.all_logs();
    assert_eq!(logs[0].block_hash, new_8);
    assert!(logs.iter().all(|l| l.block_hash != old_8 && l.block_hash != old_9));
    assert!(p.metrics().reorgs >= 1);
    assert!(p.health_report().healthy);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn reorg_beyond_finality_is_reported() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(10);
    let p = poller(config(2, 20), chain.clone(), Arc::new(MemoryStore::new(1))).await;
    p.start().await.unwrap();
    let pr = &p;
    eventually("block 10", move || async move { pr.latest_block_number().await.ok() == Some(10) }).await;

    chain.fork_at(2);
    chain.mine(10);

    eventually("critical error", move || async move {
        pr.health_report()
            .errors
            .iter()
            .any(|e| e.contains("deeper than finality depth"))
    })
    .await;
    // Retries forever, stuck at the same frontier.
    assert_eq!(p.latest_block_number().await.unwrap(), 10);
    assert!(p.metrics().poll_failures >= 1);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn write_failures_stall_then_recover() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(10);
    let store = Arc::new(MemoryStore::new(1));
    let p = poller(config(3, 20), chain.clone(), store.clone()).await;
    p.start().await.unwrap();
    let pr = &p;
    eventually("block 10", move || async move { pr.latest_block_number().await.ok() == Some(10) }).await;

    store.fail_writes(true);
    chain.mine(3);
    chain.emit(12, addr(), sig(), vec![], vec![]).unwrap();
    eventually("failures", move || async move { pr.metrics().poll_failures >= 2 }).await;
    assert_eq!(p.latest_block_number().await.unwrap(), 10);
    assert_eq!(store.log_count(), 0);
    // Transient failures are not escalated.
    assert!(p.health_report().healthy);

    store.fail_writes(false);
    eventually("block 13", move || async move { pr.latest_block_number().await.ok() == Some(13) }).await;
    assert_eq!(store.log_count(), 1);
    p.stop().await.unwrap();
}

#[tokio::test]
async fn prunes_old_blocks_and_expired_logs() {
    let chain = Arc::new(SimulatedChain::new(1));
    chain.mine(20);
    let store = Arc::new(MemoryStore::new(1));
    for n in 1..=20 {
        let header = chain.header(n).unwrap();
        let old_log = Log {
            chain_id: 1,
            log_index: 0,
            block_hash: header.hash,
            block_number: n,
            block_timestamp: 0,
            address: addr(),
            event_sig: sig(),
            topics: vec![sig()],
            data: Default::default(),
            tx_hash: B256::ZERO,
        };
        let block = Block { chain_id: 1, number: n, hash: header.hash, timestamp: header.timestamp };
        store
            .commit(WriteBatch::new().insert_block(block).insert_logs(vec![old_log]))
            .await
            .unwrap();
    }

    let config = PollerConfig {
        poll_interval_ms: 10,
        finality_depth: 2,
        keep_blocks_depth: 3,
        block_prune_factor: 1,
        log_prune_factor: 1,
        default_log_retention_secs: 60,
        jitter_fraction: 0.0,
        ..Default::default()
    };
    let p = poller(config, chain, store.clone()).await;
    p.start().await.unwrap();

    let st = &store;
    eventually("block prune", move || async move {
        st.blocks_range(0, 100).await.map(|b| b.len()).unwrap_or(0) == 4
    })
    .await;
    eventually("log prune", move || async move { st.log_count() == 0 }).await;

    let metrics = p.metrics();
    assert_eq!(metrics.blocks_pruned, 16);
    assert_eq!(metrics.logs_pruned, 20);
    p.stop().await.unwrap();
}
