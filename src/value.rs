//! Immutable descriptors of what to compute and what was computed.
//!
//! * [`ValueRequirement`] asks for a named value on a target, constrained by a
//!   set of properties.
//! * [`ValueSpecification`] names an exact value that some function is able to
//!   produce, with its resolved properties.
//!
//! A specification *satisfies* a requirement when the value names and targets
//! are equal and every constrained property is compatible.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::ArcStr;

/// Names of properties the engine itself attaches to specifications.
pub mod property_names {
    /// The unique identifier of the parameterized function producing a value.
    pub const FUNCTION: &str = "Function";
}

/// The kind of subject a computation is performed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ComputationTargetType {
    /// A free-standing value not attached to any domain object (e.g. a curve).
    Primitive,
    Security,
    Trade,
    Position,
    /// An aggregate of positions.
    PortfolioNode,
}

impl fmt::Display for ComputationTargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComputationTargetType::Primitive => "PRIMITIVE",
            ComputationTargetType::Security => "SECURITY",
            ComputationTargetType::Trade => "TRADE",
            ComputationTargetType::Position => "POSITION",
            ComputationTargetType::PortfolioNode => "PORTFOLIO_NODE",
        };
        f.write_str(name)
    }
}

/// Identifies the subject of a computation, e.g. "security with id X".
///
/// Cloning is cheap, the identifier is shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationTargetSpecification {
    kind: ComputationTargetType,
    id: ArcStr,
}

impl ComputationTargetSpecification {
    pub fn new(kind: ComputationTargetType, id: impl Into<ArcStr>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn primitive(id: impl Into<ArcStr>) -> Self {
        Self::new(ComputationTargetType::Primitive, id)
    }

    pub fn security(id: impl Into<ArcStr>) -> Self {
        Self::new(ComputationTargetType::Security, id)
    }

    pub fn position(id: impl Into<ArcStr>) -> Self {
        Self::new(ComputationTargetType::Position, id)
    }

    pub fn target_type(&self) -> ComputationTargetType {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for ComputationTargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.kind, self.id)
    }
}

/// The admissible values of a single property.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Wildcard. In a requirement: the property must be present with any
    /// value. In a specification: the producer can supply any value.
    Any,
    /// An explicit set of values. In a requirement the producer must offer at
    /// least one of them.
    Values(BTreeSet<String>),
}

impl PropertyValue {
    fn single(value: impl Into<String>) -> Self {
        PropertyValue::Values(BTreeSet::from([value.into()]))
    }

    fn is_compatible(&self, offered: &PropertyValue) -> bool {
        match (self, offered) {
            (PropertyValue::Any, _) | (_, PropertyValue::Any) => true,
            (PropertyValue::Values(wanted), PropertyValue::Values(offered)) => {
                !wanted.is_disjoint(offered)
            }
        }
    }

    /// Narrows an offered value so that it also satisfies the constraint.
    fn narrow(&self, constraint: &PropertyValue) -> PropertyValue {
        match (self, constraint) {
            (PropertyValue::Any, constraint) => constraint.clone(),
            (offered, PropertyValue::Any) => offered.clone(),
            (PropertyValue::Values(offered), PropertyValue::Values(wanted)) => {
                PropertyValue::Values(offered.intersection(wanted).cloned().collect())
            }
        }
    }
}

/// A set of named properties, used both for requirement constraints and for
/// the resolved properties of a specification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueProperties {
    properties: BTreeMap<String, PropertyValue>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    optional: BTreeSet<String>,
}

impl ValueProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property with a single value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .insert(name.into(), PropertyValue::single(value));
        self
    }

    /// Adds a property admitting any of the given values.
    pub fn with_values<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.properties
            .insert(name.into(), PropertyValue::Values(values));
        self
    }

    /// Adds a wildcard property.
    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into(), PropertyValue::Any);
        self
    }

    /// Marks a constraint as optional: a specification lacking the property
    /// still satisfies it.
    pub fn with_optional(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.properties
            .entry(name.clone())
            .or_insert(PropertyValue::Any);
        self.optional.insert(name);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Returns the value of a property when it resolved to exactly one value.
    pub fn get_single(&self, name: &str) -> Option<&str> {
        match self.properties.get(name)? {
            PropertyValue::Values(values) if values.len() == 1 => {
                values.iter().next().map(String::as_str)
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Checks whether the offered properties meet every constraint in `self`.
    pub fn is_satisfied_by(&self, offered: &ValueProperties) -> bool {
        self.properties.iter().all(|(name, wanted)| {
            match offered.properties.get(name) {
                Some(offered) => wanted.is_compatible(offered),
                None => self.optional.contains(name),
            }
        })
    }

    /// Narrows the offered properties (`self`) by the given constraints.
    ///
    /// Wildcards in `self` take the constrained values, explicit sets are
    /// intersected, and properties not mentioned by the constraints are kept.
    pub fn compose(&self, constraints: &ValueProperties) -> ValueProperties {
        let properties = self
            .properties
            .iter()
            .map(|(name, offered)| {
                let value = match constraints.properties.get(name) {
                    Some(constraint) => offered.narrow(constraint),
                    None => offered.clone(),
                };
                (name.clone(), value)
            })
            .collect();

        ValueProperties {
            properties,
            optional: BTreeSet::new(),
        }
    }
}

impl fmt::Display for ValueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let optional = if self.optional.contains(name) { "?" } else { "" };
            match value {
                PropertyValue::Any => write!(f, "{name}{optional}=*")?,
                PropertyValue::Values(values) => {
                    let joined = values.iter().cloned().collect::<Vec<_>>().join("|");
                    write!(f, "{name}{optional}={joined}")?
                }
            }
        }
        f.write_str("}")
    }
}

/// "I need value V on target T satisfying constraints C".
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRequirement {
    value_name: ArcStr,
    target: ComputationTargetSpecification,
    constraints: ValueProperties,
}

impl ValueRequirement {
    pub fn new(value_name: impl Into<ArcStr>, target: ComputationTargetSpecification) -> Self {
        Self::with_constraints(value_name, target, ValueProperties::default())
    }

    pub fn with_constraints(
        value_name: impl Into<ArcStr>,
        target: ComputationTargetSpecification,
        constraints: ValueProperties,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints,
        }
    }

    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.target
    }

    pub fn constraints(&self) -> &ValueProperties {
        &self.constraints
    }

    pub fn is_satisfied_by(&self, specification: &ValueSpecification) -> bool {
        self.value_name == specification.value_name
            && self.target == specification.target
            && self.constraints.is_satisfied_by(&specification.properties)
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.value_name, self.target, self.constraints)
    }
}

/// "This exact value, with these resolved properties, is available".
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    value_name: ArcStr,
    target: ComputationTargetSpecification,
    properties: ValueProperties,
}

impl ValueSpecification {
    pub fn new(
        value_name: impl Into<ArcStr>,
        target: ComputationTargetSpecification,
        properties: ValueProperties,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties,
        }
    }

    pub fn value_name(&self) -> &str {
        &self.value_name
    }

    pub fn target(&self) -> &ComputationTargetSpecification {
        &self.target
    }

    pub fn properties(&self) -> &ValueProperties {
        &self.properties
    }

    /// The unique id of the function which produces this value, if known.
    pub fn function_id(&self) -> Option<&str> {
        self.properties.get_single(property_names::FUNCTION)
    }

    pub fn satisfies(&self, requirement: &ValueRequirement) -> bool {
        requirement.is_satisfied_by(self)
    }

    /// Narrows this specification by the constraints of a requirement it
    /// satisfies.
    pub fn compose(&self, requirement: &ValueRequirement) -> ValueSpecification {
        ValueSpecification {
            value_name: Arc::clone(&self.value_name),
            target: self.target.clone(),
            properties: self.properties.compose(&requirement.constraints),
        }
    }

    /// Returns a copy tagged with the producing function.
    pub fn with_function(&self, function_id: &str) -> ValueSpecification {
        ValueSpecification {
            value_name: Arc::clone(&self.value_name),
            target: self.target.clone(),
            properties: self
                .properties
                .clone()
                .with(property_names::FUNCTION, function_id),
        }
    }

    /// Returns a copy attached to a different target.
    pub fn with_target(&self, target: ComputationTargetSpecification) -> ValueSpecification {
        ValueSpecification {
            value_name: Arc::clone(&self.value_name),
            target,
            properties: self.properties.clone(),
        }
    }

    /// The loosest requirement this specification satisfies.
    pub fn to_requirement(&self) -> ValueRequirement {
        ValueRequirement::with_constraints(
            Arc::clone(&self.value_name),
            self.target.clone(),
            self.properties.clone(),
        )
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]{}", self.value_name, self.target, self.properties)
    }
}
