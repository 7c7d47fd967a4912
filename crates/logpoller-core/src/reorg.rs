//! Reorg detection and canonical-chain repair.
//!
//! Before a block is treated as "current", its parent hash is compared with
//! the persisted block one below it. On a mismatch the resolver walks the
//! remote chain backward, by parent hash, until a remote ancestor agrees
//! with the persisted block at the same height (the last common ancestor),
//! truncates everything above that ancestor, and hands back the first
//! divergent remote block as the new current block.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::client::ChainClient;
use crate::error::PollerError;
use crate::store::{LogStore, WriteBatch};
use crate::types::Header;

/// Describes a repaired chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// The block number whose parent no longer matched.
    pub detected_at: u64,
    /// Last common ancestor; everything above it was truncated.
    pub common_ancestor: u64,
    /// Number of persisted heights discarded below `detected_at`.
    pub depth: u64,
}

/// Outcome of [`ReorgResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolved {
    /// The header to treat as current. Equals the requested block unless a
    /// reorg moved it back to the block after the common ancestor.
    pub header: Header,
    pub reorg: Option<ReorgEvent>,
}

/// Validates the frontier against persisted history and repairs reorgs.
pub struct ReorgResolver {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn LogStore>,
    finality_depth: u64,
}

impl ReorgResolver {
    pub fn new(client: Arc<dyn ChainClient>, store: Arc<dyn LogStore>, finality_depth: u64) -> Self {
        Self {
            client,
            store,
            finality_depth,
        }
    }

    /// Fetch the header at `number`, rejecting empty or mislabelled responses.
    pub async fn fetch_header(&self, number: u64) -> Result<Header, PollerError> {
        let header = self
            .client
            .header_by_number(Some(number))
            .await?
            .ok_or(PollerError::MissingHeader { number })?;
        if header.number != number {
            return Err(PollerError::HeaderNumberMismatch {
                requested: number,
                got: header.number,
            });
        }
        Ok(header)
    }

    /// Validate `number` against the persisted chain, repairing a reorg if
    /// one is found. `fetched` skips the header lookup when the caller
    /// already has it.
    pub async fn resolve(&self, number: u64, fetched: Option<Header>) -> Result<Resolved, PollerError> {
        let header = match fetched {
            Some(h) if h.number == number => h,
            Some(h) => {
                return Err(PollerError::HeaderNumberMismatch {
                    requested: number,
                    got: h.number,
                })
            }
            None => self.fetch_header(number).await?,
        };

        let Some(parent_number) = number.checked_sub(1) else {
            return Ok(Resolved { header, reorg: None });
        };
        // Nothing persisted below: first poll, or just after a backfill.
        let Some(parent) = self.store.block_by_number(parent_number).await? else {
            return Ok(Resolved { header, reorg: None });
        };
        if header.extends(&parent) {
            return Ok(Resolved { header, reorg: None });
        }

        warn!(
            at = number,
            expected = %parent.hash,
            actual = %header.parent_hash,
            "Reorg detected"
        );

        let after_lca = self.find_block_after_lca(&header).await?;
        let lca = after_lca.number.saturating_sub(1);

        self.store
            .commit(WriteBatch::new().delete_blocks_after(lca).delete_logs_after(lca))
            .await?;

        let event = ReorgEvent {
            detected_at: number,
            common_ancestor: lca,
            depth: parent_number - lca,
        };
        warn!(
            depth = event.depth,
            common_ancestor = lca,
            new_current = after_lca.number,
            "Truncated persisted chain after common ancestor"
        );
        Ok(Resolved {
            header: after_lca,
            reorg: Some(event),
        })
    }

    /// Walk back from `mismatch` until a remote ancestor matches the persisted
    /// block at its height. Returns that ancestor's remote child.
    async fn find_block_after_lca(&self, mismatch: &Header) -> Result<Header, PollerError> {
        let mut current = mismatch.clone();
        for _ in 0..self.finality_depth {
            let parent = self
                .client
                .header_by_hash(current.parent_hash)
                .await?
                .ok_or_else(|| PollerError::InvalidHeader {
                    number: current.number.saturating_sub(1),
                    reason: format!("parent {} not found by hash", current.parent_hash),
                })?;
            if parent.number + 1 != current.number {
                return Err(PollerError::InvalidHeader {
                    number: parent.number,
                    reason: format!("expected parent of block {}", current.number),
                });
            }

            let ours = self
                .store
                .block_by_number(parent.number)
                .await?
                .ok_or(PollerError::MissingStoredBlock { number: parent.number })?;
            if ours.hash == parent.hash {
                debug!(common_ancestor = parent.number, "Found common ancestor");
                return Ok(current);
            }
            current = parent;
        }

        error!(
            at = mismatch.number,
            finality_depth = self.finality_depth,
            "Reorg deeper than finality depth"
        );
        Err(PollerError::FinalityViolated {
            block_number: mismatch.number,
            finality_depth: self.finality_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::sim::SimulatedChain;
    use alloy_primitives::{Address, B256};

    /// Persist the canonical blocks `1..=upto` with one log each.
    async fn persist(chain: &SimulatedChain, store: &MemoryStore, upto: u64) {
        for n in 1..=upto {
            let header = chain.header(n).unwrap();
            let log = chain
                .emit(n, Address::repeat_byte(1), B256::repeat_byte(0xee), vec![], vec![])
                .unwrap();
            store
                .commit(WriteBatch::new().insert_block(header.to_block(1)).insert_logs(vec![log]))
                .await
                .unwrap();
        }
    }

    fn setup(finality: u64) -> (Arc<SimulatedChain>, Arc<MemoryStore>, ReorgResolver) {
        let chain = Arc::new(SimulatedChain::new(1));
        let store = Arc::new(MemoryStore::new(1));
        let resolver = ReorgResolver::new(chain.clone(), store.clone(), finality);
        (chain, store, resolver)
    }

    #[tokio::test]
    async fn no_reorg_on_matching_parent() {
        let (chain, store, resolver) = setup(5);
        chain.mine(5);
        persist(&chain, &store, 4).await;
        let resolved = resolver.resolve(5, None).await.unwrap();
        assert_eq!(resolved.header.number, 5);
        assert!(resolved.reorg.is_none());
    }

    #[tokio::test]
    async fn nothing_persisted_returns_header() {
        let (chain, _store, resolver) = setup(5);
        chain.mine(3);
        let resolved = resolver.resolve(3, None).await.unwrap();
        assert_eq!(resolved.header, chain.header(3).unwrap());
    }

    #[tokio::test]
    async fn repairs_reorg_to_block_after_lca() {
        let (chain, store, resolver) = setup(5);
        chain.mine(4);
        persist(&chain, &store, 4).await;
        let old3 = chain.header(3).unwrap();

        // Remote diverges at 3: 1 <- 2 <- 3' <- 4'
        chain.fork_at(2);
        chain.mine(2);
        let new3 = chain.header(3).unwrap();

        let resolved = resolver.resolve(4, None).await.unwrap();
        assert_eq!(resolved.header, new3);
        let event = resolved.reorg.unwrap();
        assert_eq!(event.common_ancestor, 2);
        assert_eq!(event.detected_at, 4);

        assert_eq!(store.latest_block().await.unwrap().unwrap().number, 2);
        assert!(store.all_logs().iter().all(|l| l.block_number <= 2));
        assert!(store.all_logs().iter().all(|l| l.block_hash != old3.hash));
    }

    #[tokio::test]
    async fn reorg_deeper_than_finality_is_fatal() {
        let (chain, store, resolver) = setup(5);
        chain.mine(12);
        persist(&chain, &store, 12).await;

        // Common ancestor at 2, mismatch detected at 13: 10 heights apart.
        chain.fork_at(2);
        chain.mine(11);

        let err = resolver.resolve(13, None).await.unwrap_err();
        assert!(matches!(err, PollerError::FinalityViolated { finality_depth: 5, .. }));
        assert!(err.is_critical());
        // Nothing truncated on failure.
        assert_eq!(store.latest_block().await.unwrap().unwrap().number, 12);
    }

    #[tokio::test]
    async fn rejects_mislabelled_header() {
        let (chain, _store, resolver) = setup(5);
        chain.mine(3);
        let wrong = chain.header(2).unwrap();
        let err = resolver.resolve(3, Some(wrong)).await.unwrap_err();
        assert!(matches!(err, PollerError::HeaderNumberMismatch { requested: 3, got: 2 }));
    }

    #[tokio::test]
    async fn missing_remote_header_is_error() {
        let (chain, _store, resolver) = setup(5);
        chain.mine(3);
        let err = resolver.resolve(9, None).await.unwrap_err();
        assert!(matches!(err, PollerError::MissingHeader { number: 9 }));
    }
}
