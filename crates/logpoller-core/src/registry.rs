//! Filter registry — the registered filters and the merged remote query.
//!
//! The in-memory cache is shared between the query path and the registration
//! path, so it sits behind a reader/writer lock. The lock is only held while
//! the cache is read or updated, never across a store call.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use alloy_primitives::Address;
use tracing::{debug, info, warn};

use crate::client::LogFilterQuery;
use crate::error::PollerError;
use crate::filter::Filter;
use crate::store::LogStore;

/// Address used when nothing is registered, so the remote query matches
/// nothing. Registered filters may never contain it.
pub const SENTINEL_ADDRESS: Address = Address::ZERO;

struct Inner {
    filters: HashMap<String, Filter>,
    loaded: bool,
    /// `None` when a mutation invalidated the merged query.
    merged: Option<Arc<LogFilterQuery>>,
}

/// Registry of caller filters, persisted through a [`LogStore`].
pub struct FilterRegistry {
    store: Arc<dyn LogStore>,
    inner: RwLock<Inner>,
}

impl FilterRegistry {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            inner: RwLock::new(Inner {
                filters: HashMap::new(),
                loaded: false,
                merged: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `filter`. A no-op if a filter with the same name already
    /// covers it.
    pub async fn register(&self, filter: Filter) -> Result<(), PollerError> {
        filter.validate()?;
        self.load(false).await?;

        if let Some(existing) = self.read().filters.get(&filter.name) {
            if existing.contains(&filter) {
                debug!(name = %filter.name, "Filter already registered");
                return Ok(());
            }
        }

        self.store.insert_filter(&filter).await?;

        info!(
            name = %filter.name,
            addresses = filter.addresses.len(),
            events = filter.event_sigs.len(),
            "Registered filter"
        );
        let mut inner = self.write();
        inner.filters.insert(filter.name.clone(), filter);
        inner.merged = None;
        Ok(())
    }

    /// Remove the filter called `name`. Unknown names are not an error.
    pub async fn unregister(&self, name: &str) -> Result<(), PollerError> {
        self.load(false).await?;
        if !self.read().filters.contains_key(name) {
            warn!(name, "Unregistering unknown filter");
            return Ok(());
        }

        self.store.delete_filter(name).await?;

        let mut inner = self.write();
        inner.filters.remove(name);
        inner.merged = None;
        info!(name, "Unregistered filter");
        Ok(())
    }

    /// Hydrate the cache from the store. Only the first call (or a forced
    /// one) reads the store.
    pub async fn load(&self, force: bool) -> Result<(), PollerError> {
        if self.read().loaded && !force {
            return Ok(());
        }

        let stored = self.store.load_filters().await?;

        let mut inner = self.write();
        inner.filters.extend(stored);
        inner.loaded = true;
        inner.merged = None;
        debug!(count = inner.filters.len(), "Loaded filters");
        Ok(())
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.read().filters.contains_key(name)
    }

    /// Snapshot of the registered filters, sorted by name.
    pub fn filters(&self) -> Vec<Filter> {
        let mut filters: Vec<_> = self.read().filters.values().cloned().collect();
        filters.sort_by(|a, b| a.name.cmp(&b.name));
        filters
    }

    /// The single remote query covering every registered filter.
    ///
    /// Addresses and event signatures are unioned independently, so two
    /// filters `(A, x)` and `(B, y)` also fetch `(A, y)` and `(B, x)`. Both
    /// sets are sorted so repeated calls yield identical queries.
    pub fn effective_query(&self) -> Arc<LogFilterQuery> {
        if let Some(merged) = self.read().merged.clone() {
            return merged;
        }

        let mut inner = self.write();
        // Another writer may have rebuilt it between the two locks.
        if let Some(merged) = inner.merged.clone() {
            return merged;
        }
        let merged = Arc::new(merge(inner.filters.values()));
        inner.merged = Some(merged.clone());
        merged
    }
}

fn merge<'a>(filters: impl Iterator<Item = &'a Filter>) -> LogFilterQuery {
    let mut addresses = BTreeSet::new();
    let mut sigs = BTreeSet::new();
    for filter in filters {
        addresses.extend(filter.addresses.iter().copied());
        sigs.extend(filter.event_sigs.iter().copied());
    }

    if addresses.is_empty() && sigs.is_empty() {
        return LogFilterQuery {
            addresses: vec![SENTINEL_ADDRESS],
            ..Default::default()
        };
    }

    LogFilterQuery {
        addresses: addresses.into_iter().collect(),
        topics: vec![sigs.into_iter().collect()],
        ..Default::default()
    }
}
