use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::core::Dynamic;
use crate::value::{ComputationTargetSpecification, ComputationTargetType};

/// The concrete domain object a computation runs against.
///
/// The engine never looks inside: it only carries the object from the
/// [`ComputationTargetResolver`] to the function being executed, which can
/// downcast it to the type it expects.
#[derive(Clone)]
pub struct ComputationTarget {
    specification: ComputationTargetSpecification,
    value: Dynamic,
}

impl ComputationTarget {
    pub fn new<T>(specification: ComputationTargetSpecification, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            specification,
            value: Arc::new(value),
        }
    }

    pub fn specification(&self) -> &ComputationTargetSpecification {
        &self.specification
    }

    pub fn value<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl std::fmt::Debug for ComputationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationTarget")
            .field("specification", &self.specification)
            .finish_non_exhaustive()
    }
}

/// Resolves target specifications to domain objects at execution time.
pub trait ComputationTargetResolver: Send + Sync {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget>;
}

/// A resolver backed by a map. Primitive targets resolve to themselves even
/// when they were never registered.
#[derive(Default)]
pub struct InMemoryTargetResolver {
    targets: RwLock<HashMap<ComputationTargetSpecification, ComputationTarget>>,
}

impl InMemoryTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&self, specification: ComputationTargetSpecification, value: T)
    where
        T: Any + Send + Sync,
    {
        let target = ComputationTarget::new(specification.clone(), value);
        self.targets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(specification, target);
    }
}

impl ComputationTargetResolver for InMemoryTargetResolver {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget> {
        let targets = self.targets.read().unwrap_or_else(PoisonError::into_inner);

        match targets.get(specification) {
            Some(target) => Some(target.clone()),
            None if specification.target_type() == ComputationTargetType::Primitive => Some(
                ComputationTarget::new(specification.clone(), specification.id().to_string()),
            ),
            None => None,
        }
    }
}
