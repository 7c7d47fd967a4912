//! Read-only queries over persisted logs.
//!
//! Each method builds a [`LogQuery`] and lets the store evaluate it.
//! Confirmation depths are measured against the latest persisted block.

use std::collections::HashSet;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::error::PollerError;
use crate::poller::LogPoller;
use crate::store::{LogQuery, SortOrder, TopicPredicate, ValueMatch, WordPredicate};
use crate::types::Log;

/// Minimum depth behind the latest persisted block a log's block must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Confirmations {
    /// At least `n` blocks behind. `Depth(0)` accepts everything persisted.
    Depth(u64),
    /// At least `finality_depth` blocks behind.
    #[default]
    Finalized,
}

fn check_topic_index(index: usize) -> Result<(), PollerError> {
    if !(1..=3).contains(&index) {
        return Err(PollerError::InvalidQuery(format!(
            "topic index {index} outside 1..=3"
        )));
    }
    Ok(())
}

fn base(event_sig: B256, address: Address) -> LogQuery {
    LogQuery {
        addresses: vec![address],
        event_sigs: vec![event_sig],
        ..Default::default()
    }
}

impl LogPoller {
    /// Restrict `query` to confirmed blocks. Returns `false` when nothing
    /// can be confirmed yet.
    async fn confirm(&self, query: &mut LogQuery, confs: Confirmations) -> Result<bool, PollerError> {
        let depth = match confs {
            Confirmations::Depth(0) => return Ok(true),
            Confirmations::Depth(n) => n,
            Confirmations::Finalized => self.config().finality_depth,
        };
        let Some(latest) = self.store().latest_block().await? else {
            return Ok(false);
        };
        let Some(upto) = latest.number.checked_sub(depth) else {
            return Ok(false);
        };
        query.to_block = Some(query.to_block.map_or(upto, |to| to.min(upto)));
        Ok(true)
    }

    async fn confirmed(&self, mut query: LogQuery, confs: Confirmations) -> Result<Vec<Log>, PollerError> {
        if !self.confirm(&mut query, confs).await? {
            return Ok(vec![]);
        }
        self.select_logs(&query).await
    }

    /// Evaluate an arbitrary query.
    pub async fn select_logs(&self, query: &LogQuery) -> Result<Vec<Log>, PollerError> {
        self.store().select_logs(query).await
    }

    /// Logs of `event_sig` from `address` in `[start, end]`.
    pub async fn logs(
        &self,
        start: u64,
        end: u64,
        event_sig: B256,
        address: Address,
    ) -> Result<Vec<Log>, PollerError> {
        self.logs_with_sigs(start, end, &[event_sig], address).await
    }

    /// Logs of any of `sigs` from `address` in `[start, end]`.
    pub async fn logs_with_sigs(
        &self,
        start: u64,
        end: u64,
        sigs: &[B256],
        address: Address,
    ) -> Result<Vec<Log>, PollerError> {
        let query = LogQuery {
            from_block: Some(start),
            to_block: Some(end),
            addresses: vec![address],
            event_sigs: sigs.to_vec(),
            ..Default::default()
        };
        self.select_logs(&query).await
    }

    /// Logs in blocks stamped strictly after `after` (unix seconds).
    pub async fn logs_created_after(
        &self,
        event_sig: B256,
        address: Address,
        after: i64,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let query = LogQuery {
            after_timestamp: Some(after),
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    pub async fn latest_log_by_event_sig(
        &self,
        event_sig: B256,
        address: Address,
        confs: Confirmations,
    ) -> Result<Option<Log>, PollerError> {
        let query = LogQuery {
            order: SortOrder::Descending,
            limit: Some(1),
            ..base(event_sig, address)
        };
        Ok(self.confirmed(query, confs).await?.into_iter().next())
    }

    /// The newest log of each of `sigs` at or after `start_block`, in the
    /// order of `sigs`. Signatures without a log are skipped.
    pub async fn latest_logs_by_event_sigs(
        &self,
        start_block: u64,
        sigs: &[B256],
        address: Address,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let mut latest = Vec::with_capacity(sigs.len());
        for sig in sigs {
            let query = LogQuery {
                from_block: Some(start_block),
                order: SortOrder::Descending,
                limit: Some(1),
                ..base(*sig, address)
            };
            latest.extend(self.confirmed(query, confs).await?);
        }
        Ok(latest)
    }

    /// Logs whose topic at `topic_index` equals one of `values`.
    pub async fn indexed_logs(
        &self,
        event_sig: B256,
        address: Address,
        topic_index: usize,
        values: Vec<B256>,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let query = LogQuery {
            topics: vec![TopicPredicate { index: topic_index, value: ValueMatch::AnyOf(values) }],
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    pub async fn indexed_logs_by_block_range(
        &self,
        start: u64,
        end: u64,
        event_sig: B256,
        address: Address,
        topic_index: usize,
        values: Vec<B256>,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let query = LogQuery {
            from_block: Some(start),
            to_block: Some(end),
            topics: vec![TopicPredicate { index: topic_index, value: ValueMatch::AnyOf(values) }],
            ..base(event_sig, address)
        };
        self.select_logs(&query).await
    }

    /// Logs whose topic at `topic_index` lies in `[min, max]`.
    pub async fn indexed_logs_topic_range(
        &self,
        event_sig: B256,
        address: Address,
        topic_index: usize,
        min: B256,
        max: B256,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let query = LogQuery {
            topics: vec![TopicPredicate { index: topic_index, value: ValueMatch::Range { min, max } }],
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    /// Logs whose topic at `topic_index` is at least `min`.
    pub async fn indexed_logs_topic_greater_than(
        &self,
        event_sig: B256,
        address: Address,
        topic_index: usize,
        min: B256,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let query = LogQuery {
            topics: vec![TopicPredicate { index: topic_index, value: ValueMatch::AtLeast(min) }],
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    pub async fn indexed_logs_created_after(
        &self,
        event_sig: B256,
        address: Address,
        topic_index: usize,
        values: Vec<B256>,
        after: i64,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let query = LogQuery {
            topics: vec![TopicPredicate { index: topic_index, value: ValueMatch::AnyOf(values) }],
            after_timestamp: Some(after),
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    /// Logs whose data word at `word_index` lies in `[min, max]`.
    pub async fn logs_data_word_range(
        &self,
        event_sig: B256,
        address: Address,
        word_index: usize,
        min: B256,
        max: B256,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let query = LogQuery {
            words: vec![WordPredicate { index: word_index, value: ValueMatch::Range { min, max } }],
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    pub async fn logs_data_word_greater_than(
        &self,
        event_sig: B256,
        address: Address,
        word_index: usize,
        min: B256,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        let query = LogQuery {
            words: vec![WordPredicate { index: word_index, value: ValueMatch::AtLeast(min) }],
            ..base(event_sig, address)
        };
        self.confirmed(query, confs).await
    }

    /// Logs of `sig_a` whose topic at `topic_index` has no `sig_b` log with
    /// the same value, e.g. requests without a fulfillment.
    pub async fn indexed_logs_without_match(
        &self,
        sig_a: B256,
        sig_b: B256,
        topic_index: usize,
        address: Address,
        confs: Confirmations,
    ) -> Result<Vec<Log>, PollerError> {
        check_topic_index(topic_index)?;
        let candidates = self.confirmed(base(sig_a, address), confs).await?;
        let matched: HashSet<B256> = self
            .confirmed(base(sig_b, address), confs)
            .await?
            .iter()
            .filter_map(|l| l.topic(topic_index).copied())
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|l| l.topic(topic_index).is_some_and(|t| !matched.contains(t)))
            .collect())
    }
}
