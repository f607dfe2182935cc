//! The computation cache.
//!
//! Values are stored by [`ValueSpecificationId`] in a pluggable
//! [`CacheStore`]. Every write belongs to a [`CacheEpoch`]; an entry is
//! written at most once per epoch. Writing the same value again is accepted,
//! anything else is a [`CacheError::Conflict`]. Invalidating the store drops
//! every entry and starts a new epoch, after which writes aimed at the old
//! epoch are rejected.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::core::{ComputedValue, Hash32};
use crate::error::CacheError;
use crate::identifier::{IdentifierMap, ValueSpecificationId};
use crate::job::FailureReason;
use crate::value::ValueSpecification;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheEpoch(pub u64);

impl CacheEpoch {
    pub fn next(self) -> Self {
        CacheEpoch(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEntry {
    Computed {
        value: ComputedValue,
        fingerprint: Hash32,
    },
    Failed(FailureReason),
}

impl CacheEntry {
    pub fn computed(value: ComputedValue) -> Result<Self, CacheError> {
        let fingerprint = Hash32::of_value(&value)?;
        Ok(CacheEntry::Computed { value, fingerprint })
    }

    pub fn value(&self) -> Option<&ComputedValue> {
        match self {
            CacheEntry::Computed { value, .. } => Some(value),
            CacheEntry::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            CacheEntry::Computed { .. } => None,
            CacheEntry::Failed(reason) => Some(reason),
        }
    }

    /// Whether a second write of `other` can be treated as a repeat.
    pub fn same_as(&self, other: &CacheEntry) -> bool {
        match (self, other) {
            (
                CacheEntry::Computed { fingerprint: a, .. },
                CacheEntry::Computed { fingerprint: b, .. },
            ) => a == b,
            (CacheEntry::Failed(a), CacheEntry::Failed(b)) => a == b,
            _ => false,
        }
    }
}

/// Backing storage for the computation cache.
pub trait CacheStore: Send + Sync {
    fn get(&self, id: ValueSpecificationId) -> Option<CacheEntry>;

    fn get_many(&self, ids: &[ValueSpecificationId]) -> HashMap<ValueSpecificationId, CacheEntry> {
        ids.iter()
            .filter_map(|id| Some((*id, self.get(*id)?)))
            .collect()
    }

    /// Writes all entries or none of them.
    fn put_many(
        &self,
        epoch: CacheEpoch,
        entries: Vec<(ValueSpecificationId, CacheEntry)>,
    ) -> Result<(), CacheError>;

    fn current_epoch(&self) -> CacheEpoch;

    /// Drops every entry and moves to the next epoch, which is returned.
    fn invalidate(&self) -> CacheEpoch;
}

#[derive(Default)]
struct Entries {
    epoch: CacheEpoch,
    entries: HashMap<ValueSpecificationId, CacheEntry>,
}

#[derive(Default)]
pub struct InMemoryCacheStore {
    inner: RwLock<Entries>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, id: ValueSpecificationId) -> Option<CacheEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&id)
            .cloned()
    }

    fn get_many(&self, ids: &[ValueSpecificationId]) -> HashMap<ValueSpecificationId, CacheEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .filter_map(|id| Some((*id, inner.entries.get(id)?.clone())))
            .collect()
    }

    fn put_many(
        &self,
        epoch: CacheEpoch,
        entries: Vec<(ValueSpecificationId, CacheEntry)>,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if epoch != inner.epoch {
            return Err(CacheError::StaleEpoch {
                written: epoch,
                current: inner.epoch,
            });
        }

        let mut batch: HashMap<ValueSpecificationId, &CacheEntry> = HashMap::new();
        for (id, entry) in &entries {
            let existing = inner.entries.get(id).or_else(|| batch.get(id).copied());
            if let Some(existing) = existing
                && !existing.same_as(entry)
            {
                return Err(CacheError::Conflict(*id));
            }
            batch.insert(*id, entry);
        }

        for (id, entry) in entries {
            inner.entries.entry(id).or_insert(entry);
        }

        Ok(())
    }

    fn current_epoch(&self) -> CacheEpoch {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).epoch
    }

    fn invalidate(&self) -> CacheEpoch {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.epoch = inner.epoch.next();
        inner.epoch
    }
}

/// Where processing cycles get their cache from. Owns the store and the
/// identifier map the cache is addressed by.
#[derive(Clone)]
pub struct ComputationCacheSource {
    identifiers: Arc<dyn IdentifierMap>,
    store: Arc<dyn CacheStore>,
}

impl ComputationCacheSource {
    pub fn new(identifiers: Arc<dyn IdentifierMap>, store: Arc<dyn CacheStore>) -> Self {
        Self { identifiers, store }
    }

    /// An in-memory store and identifier map.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(crate::identifier::InMemoryIdentifierMap::new()),
            Arc::new(InMemoryCacheStore::new()),
        )
    }

    pub fn identifiers(&self) -> &Arc<dyn IdentifierMap> {
        &self.identifiers
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// A cache handle bound to the current epoch.
    pub fn open(&self) -> ComputationCache {
        ComputationCache {
            identifiers: Arc::clone(&self.identifiers),
            store: Arc::clone(&self.store),
            epoch: self.store.current_epoch(),
        }
    }

    /// Clears the cache. Handles opened before stop accepting writes.
    pub fn invalidate(&self) -> CacheEpoch {
        let epoch = self.store.invalidate();
        tracing::debug!("cache invalidated, now at epoch {}", epoch.0);
        epoch
    }

    /// Reads entries on behalf of a calculation node working in `epoch`.
    pub fn query(
        &self,
        epoch: CacheEpoch,
        ids: &[ValueSpecificationId],
    ) -> Result<HashMap<ValueSpecificationId, CacheEntry>, CacheError> {
        let current = self.store.current_epoch();
        if epoch != current {
            return Err(CacheError::StaleEpoch {
                written: epoch,
                current,
            });
        }
        Ok(self.store.get_many(ids))
    }
}

/// A view of the cache for one epoch, addressed by specification.
#[derive(Clone)]
pub struct ComputationCache {
    identifiers: Arc<dyn IdentifierMap>,
    store: Arc<dyn CacheStore>,
    epoch: CacheEpoch,
}

impl ComputationCache {
    pub fn epoch(&self) -> CacheEpoch {
        self.epoch
    }

    /// Whether the store is still at the epoch this handle was opened in.
    pub fn is_current(&self) -> bool {
        self.store.current_epoch() == self.epoch
    }

    pub fn identifiers(&self) -> &Arc<dyn IdentifierMap> {
        &self.identifiers
    }

    pub fn put(&self, specification: &ValueSpecification, value: ComputedValue) -> Result<(), CacheError> {
        let id = self.identifiers.identifier(specification);
        self.put_entries(vec![(id, CacheEntry::computed(value)?)])
    }

    pub fn put_failure(
        &self,
        specification: &ValueSpecification,
        reason: FailureReason,
    ) -> Result<(), CacheError> {
        let id = self.identifiers.identifier(specification);
        self.put_entries(vec![(id, CacheEntry::Failed(reason))])
    }

    pub fn put_entries(&self, entries: Vec<(ValueSpecificationId, CacheEntry)>) -> Result<(), CacheError> {
        self.store.put_many(self.epoch, entries)
    }

    pub fn get_by_id(&self, id: ValueSpecificationId) -> Option<CacheEntry> {
        if !self.is_current() {
            return None;
        }
        self.store.get(id)
    }

    /// Reads by specification. Specifications never given an id have no
    /// entry and are not given one.
    pub fn get(&self, specification: &ValueSpecification) -> Option<CacheEntry> {
        self.get_by_id(self.identifiers.find(specification)?)
    }

    pub fn get_value(&self, specification: &ValueSpecification) -> Option<ComputedValue> {
        self.get(specification)?.value().cloned()
    }

    pub fn get_many(&self, ids: &[ValueSpecificationId]) -> HashMap<ValueSpecificationId, CacheEntry> {
        if !self.is_current() {
            return HashMap::new();
        }
        self.store.get_many(ids)
    }
}
