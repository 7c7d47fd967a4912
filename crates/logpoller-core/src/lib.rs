//! logpoller-core — reorg-aware log poller for EVM-style chains.
//!
//! Keeps a durable, query-able copy of every log matching the registered
//! filters, and repairs persisted history when the chain reorganizes.
//!
//! # Architecture
//!
//! ```text
//! LogPoller (control loop: poll / backup / prune timers + replay inbox)
//!     ├── Ingestor        (one ingestion cycle)
//!     │     ├── ReorgResolver  (parent-hash check, LCA walk, truncation)
//!     │     └── RangeFetcher   (finalized backfill, block resolution)
//!     ├── FilterRegistry  (filters → one merged remote query)
//!     ├── HealthMonitor / PollerMetrics
//!     └── collaborators: ChainClient (RPC) + LogStore (memory / SQLite)
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod health;
pub mod ingest;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod poller;
pub mod query;
pub mod registry;
pub mod reorg;
pub mod sim;
pub mod store;
pub mod types;

pub use client::{ChainClient, LogFilterQuery};
pub use config::PollerConfig;
pub use error::PollerError;
pub use fetcher::RangeFetcher;
pub use filter::{Filter, RetentionRule};
pub use health::{HealthMonitor, HealthReport, PollerState};
pub use logging::{init_tracing, LogConfig};
pub use memory::MemoryStore;
pub use metrics::{MetricsSnapshot, PollerMetrics};
pub use poller::LogPoller;
pub use query::Confirmations;
pub use registry::{FilterRegistry, SENTINEL_ADDRESS};
pub use reorg::{ReorgEvent, ReorgResolver};
pub use sim::SimulatedChain;
pub use store::{LogQuery, LogStore, SortOrder, TopicPredicate, ValueMatch, WordPredicate, WriteBatch, WriteOp};
pub use types::{Block, Header, Log};
