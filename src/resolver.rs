//! Picking a function for a requirement.
//!
//! The [`FunctionResolver`] holds every [`ResolutionRule`] in a fixed order:
//! descending priority, then ascending unique id. Candidates for a requirement
//! are always produced in that order, so resolving the same requirement twice
//! picks the same function no matter which thread asks.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::function::{FunctionDefinition, FunctionRepository, ParameterizedFunction};
use crate::value::{ValueRequirement, ValueSpecification};

/// Assigns a priority to each function. Higher wins.
pub trait FunctionPriority: Send + Sync {
    fn priority(&self, function: &dyn FunctionDefinition) -> i32;
}

impl<F> FunctionPriority for F
where
    F: Fn(&dyn FunctionDefinition) -> i32 + Send + Sync,
{
    fn priority(&self, function: &dyn FunctionDefinition) -> i32 {
        self(function)
    }
}

/// A priority rule as it appears in configuration: a glob matched against the
/// short name of a function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriorityRuleConfig {
    pub pattern: String,
    pub priority: i32,
}

/// Priorities assigned by glob patterns over function short names. The first
/// matching pattern wins; unmatched functions get the default priority.
#[derive(Debug, Clone, Default)]
pub struct PriorityRules {
    rules: Vec<(Pattern, i32)>,
    default: i32,
}

impl PriorityRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, pattern: &str, priority: i32) -> Result<Self, glob::PatternError> {
        self.rules.push((Pattern::new(pattern)?, priority));
        Ok(self)
    }

    pub fn default_priority(mut self, priority: i32) -> Self {
        self.default = priority;
        self
    }

    pub fn from_config(rules: &[PriorityRuleConfig]) -> Result<Self, glob::PatternError> {
        rules
            .iter()
            .try_fold(Self::new(), |acc, rule| acc.rule(&rule.pattern, rule.priority))
    }
}

impl FunctionPriority for PriorityRules {
    fn priority(&self, function: &dyn FunctionDefinition) -> i32 {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(function.short_name()))
            .map(|(_, priority)| *priority)
            .unwrap_or(self.default)
    }
}

/// A parameterized function with the priority it resolves at.
#[derive(Debug, Clone)]
pub struct ResolutionRule {
    pub function: ParameterizedFunction,
    pub priority: i32,
}

/// One way of satisfying a requirement.
#[derive(Debug, Clone)]
pub struct ResolutionCandidate {
    pub function: ParameterizedFunction,
    /// The output satisfying the requirement, narrowed by its constraints.
    pub output: ValueSpecification,
    /// Every output the function would produce on the target, including
    /// `output`.
    pub outputs: BTreeSet<ValueSpecification>,
}

pub struct FunctionResolver {
    rules: Vec<ResolutionRule>,
}

impl FunctionResolver {
    /// Creates rules for every computed function in the repository, bound to
    /// its default parameters.
    pub fn new(repository: &FunctionRepository, priority: &dyn FunctionPriority) -> Self {
        let rules = repository
            .functions()
            .map(|definition| ResolutionRule {
                priority: priority.priority(definition.as_ref()),
                function: ParameterizedFunction::with_defaults(Arc::clone(definition)),
            })
            .collect();

        Self::from_rules(rules)
    }

    /// Creates a resolver from explicit rules, e.g. with parameter overrides.
    pub fn from_rules(mut rules: Vec<ResolutionRule>) -> Self {
        rules.sort_by(|a, b| {
            (Reverse(a.priority), a.function.unique_id())
                .cmp(&(Reverse(b.priority), b.function.unique_id()))
        });

        Self { rules }
    }

    pub fn rules(&self) -> &[ResolutionRule] {
        &self.rules
    }

    /// All candidates able to produce the requirement, best first.
    pub fn candidates(&self, requirement: &ValueRequirement) -> Vec<ResolutionCandidate> {
        self.rules
            .iter()
            .filter(|rule| rule.function.definition().can_apply_to(requirement.target()))
            .filter_map(|rule| Self::candidate(&rule.function, requirement))
            .collect()
    }

    fn candidate(
        function: &ParameterizedFunction,
        requirement: &ValueRequirement,
    ) -> Option<ResolutionCandidate> {
        let mut outputs: BTreeSet<ValueSpecification> = function
            .definition()
            .results(requirement.target())
            .iter()
            .map(|result| result.with_function(function.unique_id()))
            .collect();

        let matched = outputs
            .iter()
            .find(|output| output.satisfies(requirement))?
            .clone();

        let output = matched.compose(requirement);
        outputs.remove(&matched);
        outputs.insert(output.clone());

        Some(ResolutionCandidate {
            function: function.clone(),
            output,
            outputs,
        })
    }
}
