//! Interning of value specifications.
//!
//! Jobs and cache entries address values by [`ValueSpecificationId`] instead
//! of by full specification. An [`IdentifierMap`] hands out those ids and
//! translates them back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::IdentifierError;
use crate::value::ValueSpecification;

/// Process-local identifier of an interned [`ValueSpecification`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecificationId(pub u64);

impl std::fmt::Display for ValueSpecificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A bijection between specifications and identifiers, for the lifetime of
/// the map.
pub trait IdentifierMap: Send + Sync {
    /// Returns the id issued for an equal specification, or issues a new one.
    fn identifier(&self, specification: &ValueSpecification) -> ValueSpecificationId;

    /// The id already issued for `specification`, without issuing one.
    fn find(&self, specification: &ValueSpecification) -> Option<ValueSpecificationId>;

    /// Bulk form of [`identifier`](Self::identifier).
    fn identifiers<'a>(
        &self,
        specifications: &mut dyn Iterator<Item = &'a ValueSpecification>,
    ) -> HashMap<ValueSpecification, ValueSpecificationId> {
        specifications
            .map(|specification| (specification.clone(), self.identifier(specification)))
            .collect()
    }

    fn value_specification(
        &self,
        identifier: ValueSpecificationId,
    ) -> Result<ValueSpecification, IdentifierError>;

    fn value_specifications(
        &self,
        identifiers: &[ValueSpecificationId],
    ) -> Result<BTreeMap<ValueSpecificationId, ValueSpecification>, IdentifierError> {
        identifiers
            .iter()
            .map(|id| Ok((*id, self.value_specification(*id)?)))
            .collect()
    }
}

#[derive(Default)]
struct Interned {
    ids: HashMap<ValueSpecification, ValueSpecificationId>,
    specifications: HashMap<ValueSpecificationId, ValueSpecification>,
    next: u64,
}

impl Interned {
    fn allocate(&mut self, specification: &ValueSpecification) -> ValueSpecificationId {
        if let Some(id) = self.ids.get(specification) {
            return *id;
        }

        let id = ValueSpecificationId(self.next);
        self.next += 1;
        self.ids.insert(specification.clone(), id);
        self.specifications.insert(id, specification.clone());
        id
    }
}

/// An [`IdentifierMap`] kept in memory. Lookups of known specifications only
/// take the read lock; allocation re-checks under the write lock, so racing
/// callers agree on a single id.
#[derive(Default)]
pub struct InMemoryIdentifierMap {
    inner: RwLock<Interned>,
}

impl InMemoryIdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentifierMap for InMemoryIdentifierMap {
    fn find(&self, specification: &ValueSpecification) -> Option<ValueSpecificationId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .get(specification)
            .copied()
    }

    fn identifier(&self, specification: &ValueSpecification) -> ValueSpecificationId {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = inner.ids.get(specification) {
                return *id;
            }
        }

        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(specification)
    }

    /// Allocates every missing id under a single write lock.
    fn identifiers<'a>(
        &self,
        specifications: &mut dyn Iterator<Item = &'a ValueSpecification>,
    ) -> HashMap<ValueSpecification, ValueSpecificationId> {
        let mut resolved = HashMap::new();
        let mut missing = Vec::new();

        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            for specification in specifications {
                match inner.ids.get(specification) {
                    Some(id) => {
                        resolved.insert(specification.clone(), *id);
                    }
                    None => missing.push(specification),
                }
            }
        }

        if !missing.is_empty() {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            for specification in missing {
                let id = inner.allocate(specification);
                resolved.insert(specification.clone(), id);
            }
        }

        resolved
    }

    fn value_specification(
        &self,
        identifier: ValueSpecificationId,
    ) -> Result<ValueSpecification, IdentifierError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .specifications
            .get(&identifier)
            .cloned()
            .ok_or(IdentifierError::NotFound(identifier))
    }
}
