//! Error types for the log poller.

use thiserror::Error;

/// Errors that can occur while polling, repairing, or querying chain history.
#[derive(Debug, Clone, Error)]
pub enum PollerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// The provider refused a log query because the result set or response
    /// size exceeded its per-call limit.
    #[error("Provider result limit exceeded: {0}")]
    ResultLimitExceeded(String),

    #[error("Provider returned no header for block {number}")]
    MissingHeader { number: u64 },

    #[error("Provider returned no latest header")]
    MissingLatestHeader,

    #[error("Provider returned header {got} when block {requested} was requested")]
    HeaderNumberMismatch { requested: u64, got: u64 },

    #[error("Invalid header for block {number}: {reason}")]
    InvalidHeader { number: u64, reason: String },

    #[error("No persisted block at {number} to compare against during reorg search")]
    MissingStoredBlock { number: u64 },

    /// No common ancestor within `finality_depth` blocks of the mismatch.
    #[error("Reorg at block {block_number} is deeper than finality depth {finality_depth}")]
    FinalityViolated { block_number: u64, finality_depth: u64 },

    /// A single block's logs exceed the provider's limit and cannot be split further.
    #[error("Backfill cannot shrink below one block at {block_number}: {reason}")]
    BackfillLimitExceeded { block_number: u64, reason: String },

    #[error("Blocks could not be resolved locally or remotely: {0:?}")]
    BlocksNotFound(Vec<u64>),

    #[error("Chain head {latest} is shorter than finality depth {finality_depth}")]
    ChainTooShort { latest: u64, finality_depth: u64 },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("No blocks persisted yet")]
    NoBlocks,

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The caller cancelled before the replay request was accepted.
    #[error("Replay aborted before it was accepted")]
    ReplayAborted,

    /// The caller stopped waiting; the replay keeps running in the background.
    #[error("Replay in progress; caller stopped waiting")]
    ReplayInProgress,

    #[error("Replay interrupted: log poller is shutting down")]
    ReplayShutdown,

    #[error("Log poller already started")]
    AlreadyStarted,

    #[error("Log poller not started")]
    NotStarted,

    #[error("{0}")]
    Other(String),
}

impl PollerError {
    /// Returns `true` if the provider rejected a query for being too large.
    pub fn is_result_limit(&self) -> bool {
        matches!(self, Self::ResultLimitExceeded(_))
    }

    /// Returns `true` for conditions that must be escalated to health reporting
    /// rather than only logged.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::FinalityViolated { .. } | Self::BackfillLimitExceeded { .. }
        )
    }

    /// Returns `true` for the replay rendezvous outcomes that are not results
    /// of the ingestion itself.
    pub fn is_replay_coordination(&self) -> bool {
        matches!(
            self,
            Self::ReplayAborted | Self::ReplayInProgress | Self::ReplayShutdown
        )
    }
}
