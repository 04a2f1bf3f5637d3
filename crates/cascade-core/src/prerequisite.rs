//! Prerequisite gates on stages and triggers.

use crate::parameter::ParameterBag;
use crate::template;
use crate::{Error, Result};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const NEGATION_PREFIX: &str = "not ";

/// A (parameter, expected pattern) gate. The pattern is a regular expression,
/// optionally prefixed with `not ` to invert the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Prerequisite {
    pub parameter: String,
    pub expected_value: String,
}

impl Prerequisite {
    pub fn new(parameter: impl Into<String>, expected_value: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            expected_value: expected_value.into(),
        }
    }

    /// Reject patterns that can never compile. Patterns that still contain
    /// placeholders are only checked once resolved at evaluation time.
    pub fn validate(&self) -> Result<()> {
        if self.parameter.trim().is_empty() {
            return Err(Error::InvalidPrerequisite {
                parameter: self.parameter.clone(),
                reason: "parameter name is empty".to_string(),
            });
        }
        if template::has_placeholders(&self.expected_value) {
            return Ok(());
        }
        let (_, pattern) = split_negation(&self.expected_value);
        self.compile(pattern).map(|_| ())
    }

    /// Evaluate against a parameter bag. A parameter absent from the bag
    /// never satisfies the gate, negated or not.
    pub fn is_satisfied(&self, bag: &ParameterBag) -> Result<bool> {
        let resolved = template::resolve(&self.expected_value, bag);
        let (negated, pattern) = split_negation(&resolved);

        let Some(value) = bag.lookup(&self.parameter) else {
            return Ok(false);
        };

        let re = self.compile(pattern)?;
        Ok(re.is_match(value) != negated)
    }

    fn compile(&self, pattern: &str) -> Result<Regex> {
        Regex::new(&anchor(pattern)).map_err(|e| Error::InvalidPrerequisite {
            parameter: self.parameter.clone(),
            reason: e.to_string(),
        })
    }
}

fn split_negation(pattern: &str) -> (bool, &str) {
    match pattern.strip_prefix(NEGATION_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, pattern),
    }
}

fn anchor(pattern: &str) -> String {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') {
        anchored.push('$');
    }
    anchored
}

/// All prerequisites must hold. An empty list always passes.
pub fn evaluate(prerequisites: &[Prerequisite], bag: &ParameterBag) -> Result<bool> {
    for p in prerequisites {
        if !p.is_satisfied(bag)? {
            return Ok(false);
        }
    }
    Ok(true)
}
