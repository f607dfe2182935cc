//! Live data sourcing.
//!
//! Requirements a [`MarketDataProvider`] declares available become leaf nodes
//! of the dependency graph. When a cycle compiles, the provider is told which
//! values the graph needs ([`MarketDataProvider::subscribe`]); before
//! execution the cycle takes a [`MarketDataSnapshot`] and writes the leaf
//! values into the cache. Updates are pushed into the provider between
//! snapshots and never touch a running cycle.

use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::core::ComputedValue;
use crate::value::{
    ComputationTargetSpecification, ValueProperties, ValueRequirement, ValueSpecification,
};

/// An immutable view of market data taken at one point in time.
pub trait MarketDataSnapshot: Send + Sync {
    fn value(&self, specification: &ValueSpecification) -> Option<ComputedValue>;
}

pub trait MarketDataProvider: Send + Sync {
    /// The specification this provider can source for `requirement`, if any.
    fn availability(&self, requirement: &ValueRequirement) -> Option<ValueSpecification>;

    /// Declares the values a compiled graph sources from this provider.
    fn subscribe(&self, specifications: &BTreeSet<ValueSpecification>);

    fn snapshot(&self) -> Arc<dyn MarketDataSnapshot>;
}

type Key = (String, ComputationTargetSpecification);

fn key(value_name: &str, target: &ComputationTargetSpecification) -> Key {
    (value_name.to_string(), target.clone())
}

#[derive(Debug, Clone)]
struct Quote {
    properties: ValueProperties,
    value: ComputedValue,
}

#[derive(Debug, Default)]
struct Snapshot {
    quotes: HashMap<Key, ComputedValue>,
}

impl MarketDataSnapshot for Snapshot {
    fn value(&self, specification: &ValueSpecification) -> Option<ComputedValue> {
        self.quotes
            .get(&key(specification.value_name(), specification.target()))
            .cloned()
    }
}

/// A provider holding quotes in memory, updated by [`set`](Self::set).
///
/// Listeners registered with [`updates`](Self::updates) are notified about
/// changes to subscribed values.
#[derive(Default)]
pub struct InMemoryMarketData {
    quotes: RwLock<HashMap<Key, Quote>>,
    subscriptions: RwLock<BTreeSet<Key>>,
    listeners: Mutex<Vec<Sender<ValueSpecification>>>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value_name: &str, target: ComputationTargetSpecification, value: ComputedValue) {
        self.set_with_properties(value_name, target, ValueProperties::new(), value);
    }

    pub fn set_with_properties(
        &self,
        value_name: &str,
        target: ComputationTargetSpecification,
        properties: ValueProperties,
        value: ComputedValue,
    ) {
        let key = key(value_name, &target);
        self.quotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), Quote {
                properties: properties.clone(),
                value,
            });

        let subscribed = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key);

        if subscribed {
            let specification = ValueSpecification::new(value_name, target, properties);
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|listener| listener.send(specification.clone()).is_ok());
        }
    }

    pub fn remove(&self, value_name: &str, target: &ComputationTargetSpecification) -> bool {
        self.quotes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(value_name, target))
            .is_some()
    }

    /// A channel receiving every subscribed value that changes.
    pub fn updates(&self) -> Receiver<ValueSpecification> {
        let (tx, rx) = channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn subscriptions(&self) -> Vec<(String, ComputationTargetSpecification)> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl MarketDataProvider for InMemoryMarketData {
    fn availability(&self, requirement: &ValueRequirement) -> Option<ValueSpecification> {
        let quotes = self.quotes.read().unwrap_or_else(PoisonError::into_inner);
        let quote = quotes.get(&key(requirement.value_name(), requirement.target()))?;

        let specification = ValueSpecification::new(
            requirement.value_name(),
            requirement.target().clone(),
            quote.properties.clone(),
        );

        specification
            .satisfies(requirement)
            .then(|| specification.compose(requirement))
    }

    fn subscribe(&self, specifications: &BTreeSet<ValueSpecification>) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        for specification in specifications {
            if subscriptions.insert(key(specification.value_name(), specification.target())) {
                tracing::debug!("subscribed to {}", specification);
            }
        }
    }

    fn snapshot(&self) -> Arc<dyn MarketDataSnapshot> {
        let quotes = self.quotes.read().unwrap_or_else(PoisonError::into_inner);

        Arc::new(Snapshot {
            quotes: quotes
                .iter()
                .map(|(key, quote)| (key.clone(), quote.value.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn usd() -> ComputationTargetSpecification {
        ComputationTargetSpecification::primitive("USD")
    }

    #[test]
    fn test_availability() {
        let provider = InMemoryMarketData::new();
        provider.set_with_properties(
            "Spot",
            usd(),
            ValueProperties::new().with("Source", "BBG"),
            json!(1.1),
        );

        let plain = ValueRequirement::new("Spot", usd());
        let spec = provider.availability(&plain).unwrap();
        assert_eq!(spec.properties().get_single("Source"), Some("BBG"));

        let other_source = ValueRequirement::with_constraints(
            "Spot",
            usd(),
            ValueProperties::new().with("Source", "REUTERS"),
        );
        assert!(provider.availability(&other_source).is_none());
        assert!(provider.availability(&ValueRequirement::new("Vol", usd())).is_none());
    }

    #[test]
    fn test_snapshot_is_isolated_from_updates() {
        let provider = InMemoryMarketData::new();
        provider.set("Spot", usd(), json!(1.0));

        let spec = provider
            .availability(&ValueRequirement::new("Spot", usd()))
            .unwrap();
        let snapshot = provider.snapshot();
        provider.set("Spot", usd(), json!(2.0));

        assert_eq!(snapshot.value(&spec), Some(json!(1.0)));
        assert_eq!(provider.snapshot().value(&spec), Some(json!(2.0)));
    }

    #[test]
    fn test_updates_for_subscribed_values() {
        let provider = InMemoryMarketData::new();
        provider.set("Spot", usd(), json!(1.0));
        provider.set("Rate", usd(), json!(0.05));

        let updates = provider.updates();
        let spot = provider
            .availability(&ValueRequirement::new("Spot", usd()))
            .unwrap();
        provider.subscribe(&BTreeSet::from([spot]));

        provider.set("Rate", usd(), json!(0.06));
        provider.set("Spot", usd(), json!(1.2));

        let received: Vec<_> = updates.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].value_name(), "Spot");
        assert_eq!(provider.subscriptions().len(), 1);
    }
}
