//! Caller-registered interest filters.

use std::collections::HashMap;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::error::PollerError;

/// A named set of (event signature × address) interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Caller-chosen unique identifier.
    pub name: String,
    /// Topic-0 hashes of interest.
    pub event_sigs: Vec<B256>,
    /// Contract addresses of interest.
    pub addresses: Vec<Address>,
    /// How long matching logs are kept. Zero defers to the global default.
    #[serde(default)]
    pub retention: Duration,
}

impl Filter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_sigs: Vec::new(),
            addresses: Vec::new(),
            retention: Duration::ZERO,
        }
    }

    /// Add an event signature (topic 0).
    pub fn event(mut self, sig: B256) -> Self {
        self.event_sigs.push(sig);
        self
    }

    /// Add a contract address.
    pub fn address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Both sets must be non-empty and free of zero values.
    pub fn validate(&self) -> Result<(), PollerError> {
        if self.addresses.is_empty() {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}' has no addresses",
                self.name
            )));
        }
        if self.event_sigs.is_empty() {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}' has no event signatures",
                self.name
            )));
        }
        if self.addresses.iter().any(|a| a.is_zero()) {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}' contains the zero address",
                self.name
            )));
        }
        if self.event_sigs.iter().any(|s| s.is_zero()) {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}' contains a zero event signature",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns `true` if this filter's address and event sets are supersets of `other`'s.
    pub fn contains(&self, other: &Filter) -> bool {
        other.addresses.iter().all(|a| self.addresses.contains(a))
            && other.event_sigs.iter().all(|s| self.event_sigs.contains(s))
    }
}

/// How long logs for one (address, event signature) pair are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    pub address: Address,
    pub event_sig: B256,
    pub retention: Duration,
}

/// Expiry rules for every pair covered by `filters`.
///
/// A pair covered by several filters keeps the longest retention; any
/// filter resolving to "forever" (zero after defaulting) exempts the pair
/// entirely. Pairs kept forever are omitted from the result. Sorted for
/// deterministic iteration.
pub fn retention_rules<'a>(
    filters: impl IntoIterator<Item = &'a Filter>,
    default_retention: Duration,
) -> Vec<RetentionRule> {
    let mut longest: HashMap<(Address, B256), Option<Duration>> = HashMap::new();
    for filter in filters {
        let resolved = if filter.retention.is_zero() {
            default_retention
        } else {
            filter.retention
        };
        // None = keep forever
        let resolved = (!resolved.is_zero()).then_some(resolved);
        for address in &filter.addresses {
            for sig in &filter.event_sigs {
                let entry = longest.entry((*address, *sig)).or_insert(resolved);
                *entry = match (*entry, resolved) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    _ => None,
                };
            }
        }
    }
    let mut rules: Vec<_> = longest
        .into_iter()
        .filter_map(|((address, event_sig), r)| {
            r.map(|retention| RetentionRule { address, event_sig, retention })
        })
        .collect();
    rules.sort_by(|a, b| (a.address, a.event_sig).cmp(&(b.address, b.event_sig)));
    rules
}
