//! SQLite storage backend for the log poller.
//!
//! Persists blocks, logs and filter registrations to a single SQLite file.
//! Uses `sqlx` with WAL mode for concurrent read performance. Hashes,
//! addresses, topics and log data are stored as raw BLOBs, so SQLite's
//! `memcmp` ordering is the unsigned big-endian ordering the query
//! predicates expect.
//!
//! # Usage
//! ```rust,no_run
//! use logpoller_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent), chain id 1
//! let store = SqliteStore::open("./logs.db", 1).await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory(1).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use logpoller_core::error::PollerError;
use logpoller_core::filter::{retention_rules, Filter};
use logpoller_core::store::{LogQuery, LogStore, SortOrder, ValueMatch, WriteBatch, WriteOp};
use logpoller_core::types::{Block, Log, WORD_SIZE};

const LOG_COLUMNS: &str = "chain_id, block_hash, log_index, block_number, block_timestamp, \
                           address, event_sig, topics, data, tx_hash";

fn storage_err(e: sqlx::Error) -> PollerError {
    PollerError::Storage(e.to_string())
}

/// SQLite-backed storage for one chain's blocks, logs and filters.
pub struct SqliteStore {
    pool: SqlitePool,
    chain_id: u64,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`, scoped to `chain_id`.
    ///
    /// The path may be a plain file path (`"./logs.db"`) or a full
    /// SQLite URL (`"sqlite:./logs.db?mode=rwc"`).
    pub async fn open(path: &str, chain_id: u64) -> Result<Self, PollerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool, chain_id };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` gets its own database, so the pool is
    /// pinned to a single connection. All data is lost when it is dropped.
    pub async fn in_memory(chain_id: u64) -> Result<Self, PollerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool, chain_id };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn init_schema(&self) -> Result<(), PollerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        // A hash may appear at only one height; REPLACE evicts the stale row.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                chain_id   INTEGER NOT NULL,
                number     INTEGER NOT NULL,
                hash       BLOB    NOT NULL,
                timestamp  INTEGER NOT NULL,
                PRIMARY KEY (chain_id, number),
                UNIQUE (chain_id, hash)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // `topics` is the concatenation of every 32-byte topic, topic 0 included.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                chain_id         INTEGER NOT NULL,
                block_hash       BLOB    NOT NULL,
                log_index        INTEGER NOT NULL,
                block_number     INTEGER NOT NULL,
                block_timestamp  INTEGER NOT NULL,
                address          BLOB    NOT NULL,
                event_sig        BLOB    NOT NULL,
                topics           BLOB    NOT NULL,
                data             BLOB    NOT NULL,
                tx_hash          BLOB    NOT NULL,
                PRIMARY KEY (chain_id, block_hash, log_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_block
             ON logs (chain_id, block_number, log_index)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_pair
             ON logs (chain_id, address, event_sig, block_timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // One row per (address, event signature) pair of a filter.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS filters (
                chain_id      INTEGER NOT NULL,
                name          TEXT    NOT NULL,
                address       BLOB    NOT NULL,
                event_sig     BLOB    NOT NULL,
                retention_ms  INTEGER NOT NULL,
                PRIMARY KEY (chain_id, name, address, event_sig)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    // ─── Row decoding ────────────────────────────────────────────────────────────

    fn block_from_row(row: &SqliteRow) -> Result<Block, PollerError> {
        Ok(Block {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            number: row.get::<i64, _>("number") as u64,
            hash: b256(row.get::<Vec<u8>, _>("hash").as_slice())?,
            timestamp: row.get::<i64, _>("timestamp"),
        })
    }

    fn log_from_row(row: &SqliteRow) -> Result<Log, PollerError> {
        let packed: Vec<u8> = row.get("topics");
        if packed.len() % WORD_SIZE != 0 {
            return Err(PollerError::Storage(format!(
                "corrupt topics column of length {}",
                packed.len()
            )));
        }
        let topics = packed.chunks(WORD_SIZE).map(B256::from_slice).collect();
        Ok(Log {
            chain_id: row.get::<i64, _>("chain_id") as u64,
            log_index: row.get::<i64, _>("log_index") as u64,
            block_hash: b256(row.get::<Vec<u8>, _>("block_hash").as_slice())?,
            block_number: row.get::<i64, _>("block_number") as u64,
            block_timestamp: row.get::<i64, _>("block_timestamp"),
            address: address(row.get::<Vec<u8>, _>("address").as_slice())?,
            event_sig: b256(row.get::<Vec<u8>, _>("event_sig").as_slice())?,
            topics,
            data: Bytes::from(row.get::<Vec<u8>, _>("data")),
            tx_hash: b256(row.get::<Vec<u8>, _>("tx_hash").as_slice())?,
        })
    }
}

fn b256(bytes: &[u8]) -> Result<B256, PollerError> {
    if bytes.len() != 32 {
        return Err(PollerError::Storage(format!("expected 32-byte hash, got {}", bytes.len())));
    }
    Ok(B256::from_slice(bytes))
}

fn address(bytes: &[u8]) -> Result<Address, PollerError> {
    if bytes.len() != 20 {
        return Err(PollerError::Storage(format!("expected 20-byte address, got {}", bytes.len())));
    }
    Ok(Address::from_slice(bytes))
}

fn pack_topics(topics: &[B256]) -> Vec<u8> {
    topics.iter().flat_map(|t| t.0).collect()
}

/// Append `AND <predicate>` comparing the 32-byte word at `index` of the BLOB
/// column `column` against `value`. Positions past the end never match.
fn push_word_match(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, index: usize, value: &ValueMatch) {
    let offset = (index * WORD_SIZE) as i64;
    qb.push(format!(" AND length({column}) >= "));
    qb.push_bind(offset + WORD_SIZE as i64);
    let word = format!("substr({column}, {} + 1, {WORD_SIZE})", offset);
    match value {
        ValueMatch::AnyOf(values) if values.is_empty() => {
            qb.push(" AND 0");
        }
        ValueMatch::AnyOf(values) => {
            qb.push(format!(" AND {word} IN ("));
            let mut sep = qb.separated(", ");
            for v in values {
                sep.push_bind(v.to_vec());
            }
            sep.push_unseparated(")");
        }
        ValueMatch::Range { min, max } => {
            qb.push(format!(" AND {word} >= "));
            qb.push_bind(min.to_vec());
            qb.push(format!(" AND {word} <= "));
            qb.push_bind(max.to_vec());
        }
        ValueMatch::AtLeast(min) => {
            qb.push(format!(" AND {word} >= "));
            qb.push_bind(min.to_vec());
        }
    }
}

// ─── LogStore impl ───────────────────────────────────────────────────────────

#[async_trait]
impl LogStore for SqliteStore {
    async fn latest_block(&self) -> Result<Option<Block>, PollerError> {
        let row = sqlx::query(
            "SELECT chain_id, number, hash, timestamp FROM blocks
             WHERE chain_id = ? ORDER BY number DESC LIMIT 1",
        )
        .bind(self.chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::block_from_row).transpose()
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, PollerError> {
        let row = sqlx::query(
            "SELECT chain_id, number, hash, timestamp FROM blocks
             WHERE chain_id = ? AND number = ?",
        )
        .bind(self.chain_id as i64)
        .bind(number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.as_ref().map(Self::block_from_row).transpose()
    }

    async fn blocks_range(&self, min: u64, max: u64) -> Result<Vec<Block>, PollerError> {
        if min > max {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            "SELECT chain_id, number, hash, timestamp FROM blocks
             WHERE chain_id = ? AND number >= ? AND number <= ?
             ORDER BY number ASC",
        )
        .bind(self.chain_id as i64)
        .bind(min as i64)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::block_from_row).collect()
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), PollerError> {
        if batch.is_empty() {
            return Ok(());
        }
        let chain_id = self.chain_id as i64;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for op in batch.into_ops() {
            match op {
                WriteOp::InsertBlock(block) => {
                    sqlx::query(
                        "INSERT OR REPLACE INTO blocks (chain_id, number, hash, timestamp)
                         VALUES (?, ?, ?, ?)",
                    )
                    .bind(chain_id)
                    .bind(block.number as i64)
                    .bind(block.hash.to_vec())
                    .bind(block.timestamp)
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_err)?;
                }
                WriteOp::InsertLogs(logs) => {
                    for log in logs {
                        sqlx::query(
                            "INSERT OR IGNORE INTO logs
                             (chain_id, block_hash, log_index, block_number, block_timestamp,
                              address, event_sig, topics, data, tx_hash)
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        )
                        .bind(chain_id)
                        .bind(log.block_hash.to_vec())
                        .bind(log.log_index as i64)
                        .bind(log.block_number as i64)
                        .bind(log.block_timestamp)
                        .bind(log.address.to_vec())
                        .bind(log.event_sig.to_vec())
                        .bind(pack_topics(&log.topics))
                        .bind(log.data.to_vec())
                        .bind(log.tx_hash.to_vec())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                    }
                }
                WriteOp::DeleteBlocksAfter(n) => {
                    sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number > ?")
                        .bind(chain_id)
                        .bind(n as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
                WriteOp::DeleteLogsAfter(n) => {
                    sqlx::query("DELETE FROM logs WHERE chain_id = ? AND block_number > ?")
                        .bind(chain_id)
                        .bind(n as i64)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
            }
        }

        tx.commit().await.map_err(storage_err)
    }

    async fn delete_blocks_before(&self, n: u64) -> Result<u64, PollerError> {
        let result = sqlx::query("DELETE FROM blocks WHERE chain_id = ? AND number < ?")
            .bind(self.chain_id as i64)
            .bind(n as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        debug!(chain_id = self.chain_id, before = n, rows = result.rows_affected(), "pruned blocks");
        Ok(result.rows_affected())
    }

    async fn delete_expired_logs(
        &self,
        now: i64,
        default_retention: Duration,
    ) -> Result<u64, PollerError> {
        let chain_id = self.chain_id as i64;
        let filters = self.load_filters().await?;
        let rules = retention_rules(filters.values(), default_retention);
        let covered: HashSet<(Address, B256)> = filters
            .values()
            .flat_map(|f| {
                f.addresses
                    .iter()
                    .flat_map(move |a| f.event_sigs.iter().map(move |s| (*a, *s)))
            })
            .collect();

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut removed = 0;

        for rule in &rules {
            let cutoff = now.saturating_sub(rule.retention.as_secs() as i64);
            let result = sqlx::query(
                "DELETE FROM logs
                 WHERE chain_id = ? AND address = ? AND event_sig = ? AND block_timestamp < ?",
            )
            .bind(chain_id)
            .bind(rule.address.to_vec())
            .bind(rule.event_sig.to_vec())
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
            removed += result.rows_affected();
        }

        // Pairs no filter covers expire by the default, if there is one.
        if !default_retention.is_zero() {
            let cutoff = now.saturating_sub(default_retention.as_secs() as i64);
            let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM logs WHERE chain_id = ");
            qb.push_bind(chain_id);
            qb.push(" AND block_timestamp < ");
            qb.push_bind(cutoff);
            for (address, sig) in &covered {
                qb.push(" AND NOT (address = ");
                qb.push_bind(address.to_vec());
                qb.push(" AND event_sig = ");
                qb.push_bind(sig.to_vec());
                qb.push(")");
            }
            let result = qb.build().execute(&mut *tx).await.map_err(storage_err)?;
            removed += result.rows_affected();
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(chain_id = self.chain_id, rows = removed, "expired logs");
        Ok(removed)
    }

    async fn insert_filter(&self, filter: &Filter) -> Result<(), PollerError> {
        let chain_id = self.chain_id as i64;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("DELETE FROM filters WHERE chain_id = ? AND name = ?")
            .bind(chain_id)
            .bind(&filter.name)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

        for address in &filter.addresses {
            for sig in &filter.event_sigs {
                sqlx::query(
                    "INSERT OR IGNORE INTO filters
                     (chain_id, name, address, event_sig, retention_ms)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(chain_id)
                .bind(&filter.name)
                .bind(address.to_vec())
                .bind(sig.to_vec())
                .bind(filter.retention.as_millis() as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            }
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(chain_id = self.chain_id, name = %filter.name, "filter saved");
        Ok(())
    }

    async fn delete_filter(&self, name: &str) -> Result<(), PollerError> {
        sqlx::query("DELETE FROM filters WHERE chain_id = ? AND name = ?")
            .bind(self.chain_id as i64)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(())
    }

    async fn load_filters(&self) -> Result<HashMap<String, Filter>, PollerError> {
        let rows = sqlx::query(
            "SELECT name, address, event_sig, retention_ms FROM filters
             WHERE chain_id = ? ORDER BY rowid ASC",
        )
        .bind(self.chain_id as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut filters: HashMap<String, Filter> = HashMap::new();
        for row in &rows {
            let name: String = row.get("name");
            let addr = address(row.get::<Vec<u8>, _>("address").as_slice())?;
            let sig = b256(row.get::<Vec<u8>, _>("event_sig").as_slice())?;
            let retention = Duration::from_millis(row.get::<i64, _>("retention_ms") as u64);

            let filter = filters
                .entry(name.clone())
                .or_insert_with(|| Filter::new(name).retention(retention));
            if !filter.addresses.contains(&addr) {
                filter.addresses.push(addr);
            }
            if !filter.event_sigs.contains(&sig) {
                filter.event_sigs.push(sig);
            }
        }
        Ok(filters)
    }

    async fn select_logs(&self, query: &LogQuery) -> Result<Vec<Log>, PollerError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {LOG_COLUMNS} FROM logs WHERE chain_id = "));
        qb.push_bind(self.chain_id as i64);

        if let Some(from) = query.from_block {
            qb.push(" AND block_number >= ");
            qb.push_bind(from as i64);
        }
        if let Some(to) = query.to_block {
            qb.push(" AND block_number <= ");
            qb.push_bind(to as i64);
        }
        if !query.addresses.is_empty() {
            qb.push(" AND address IN (");
            let mut sep = qb.separated(", ");
            for a in &query.addresses {
                sep.push_bind(a.to_vec());
            }
            sep.push_unseparated(")");
        }
        if !query.event_sigs.is_empty() {
            qb.push(" AND event_sig IN (");
            let mut sep = qb.separated(", ");
            for s in &query.event_sigs {
                sep.push_bind(s.to_vec());
            }
            sep.push_unseparated(")");
        }
        if let Some(after) = query.after_timestamp {
            qb.push(" AND block_timestamp > ");
            qb.push_bind(after);
        }
        for p in &query.topics {
            push_word_match(&mut qb, "topics", p.index, &p.value);
        }
        for p in &query.words {
            push_word_match(&mut qb, "data", p.index, &p.value);
        }

        match query.order {
            SortOrder::Ascending => qb.push(" ORDER BY block_number ASC, log_index ASC"),
            SortOrder::Descending => qb.push(" ORDER BY block_number DESC, log_index DESC"),
        };
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(Self::log_from_row).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
