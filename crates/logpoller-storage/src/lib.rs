//! logpoller-storage — storage backends for the log poller.
//!
//! Backends:
//! - `MemoryStore` — in-memory (dev/testing, no persistence), re-exported
//!   from `logpoller-core`
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "memory")]
pub use logpoller_core::memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
