//! The remote chain collaborator.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PollerError;
use crate::types::{Header, Log};

/// A remote `eth_getLogs`-style query.
///
/// Either a block range or a single `block_hash` is set, never both.
/// `topics[i]` lists the accepted values at topic position `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilterQuery {
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub block_hash: Option<B256>,
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
}

impl LogFilterQuery {
    /// Restrict to the closed block range `[from, to]`.
    pub fn with_range(mut self, from: u64, to: u64) -> Self {
        self.from_block = Some(from);
        self.to_block = Some(to);
        self.block_hash = None;
        self
    }

    /// Restrict to the single block `hash`.
    pub fn at_block_hash(mut self, hash: B256) -> Self {
        self.block_hash = Some(hash);
        self.from_block = None;
        self.to_block = None;
        self
    }

    /// Returns `true` if `log` satisfies the address and topic constraints.
    pub fn matches(&self, log: &Log) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty() || log.topic(i).is_some_and(|t| accepted.contains(t))
        })
    }
}

/// Read-only access to a remote chain node.
///
/// Logs returned by [`filter_logs`](ChainClient::filter_logs) carry the
/// client's chain id; their `block_timestamp` may be zero.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The chain id this client is configured for.
    fn chain_id(&self) -> u64;

    /// Header at `number`, or the latest header when `number` is `None`.
    async fn header_by_number(&self, number: Option<u64>) -> Result<Option<Header>, PollerError>;

    async fn header_by_hash(&self, hash: B256) -> Result<Option<Header>, PollerError>;

    async fn filter_logs(&self, query: &LogFilterQuery) -> Result<Vec<Log>, PollerError>;

    /// Look up many headers in one round trip. The result is positionally
    /// aligned with `numbers`; unknown blocks are `None`.
    async fn batch_headers(&self, numbers: &[u64]) -> Result<Vec<Option<Header>>, PollerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    #[test]
    fn range_and_hash_are_exclusive() {
        let q = LogFilterQuery::default()
            .with_range(1, 5)
            .at_block_hash(B256::repeat_byte(1));
        assert_eq!(q.from_block, None);
        assert_eq!(q.block_hash, Some(B256::repeat_byte(1)));

        let q = q.with_range(7, 9);
        assert_eq!(q.block_hash, None);
        assert_eq!((q.from_block, q.to_block), (Some(7), Some(9)));
    }

    #[test]
    fn matches_address_and_topic0() {
        let sig = B256::repeat_byte(0xee);
        let q = LogFilterQuery {
            addresses: vec![Address::repeat_byte(1)],
            topics: vec![vec![sig]],
            ..Default::default()
        };
        let log = Log {
            chain_id: 1,
            log_index: 0,
            block_hash: B256::ZERO,
            block_number: 1,
            block_timestamp: 0,
            address: Address::repeat_byte(1),
            event_sig: sig,
            topics: vec![sig],
            data: Bytes::new(),
            tx_hash: B256::ZERO,
        };
        assert!(q.matches(&log));
        let other = Log { address: Address::repeat_byte(2), ..log.clone() };
        assert!(!q.matches(&other));
    }
}
