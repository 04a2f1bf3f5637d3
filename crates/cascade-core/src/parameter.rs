//! Named parameters and the parameter bag carried by builds.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Namespace under which pipeline parameters are published into a build.
pub const PIPELINE_NAMESPACE: &str = "cds.pip.";

/// Type tag of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[default]
    String,
    Text,
    Boolean,
    Number,
    List,
    Secret,
}

/// A single named parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: ParameterType::String,
            value: value.into(),
            description: None,
        }
    }

    pub fn with_type(mut self, param_type: ParameterType) -> Self {
        self.param_type = param_type;
        self
    }

    pub fn is_secret(&self) -> bool {
        self.param_type == ParameterType::Secret
    }
}

/// Key/value bag of parameters, unique by name. Later inserts win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ParameterBag(BTreeMap<String, Parameter>);

impl ParameterBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parameters<'a>(params: impl IntoIterator<Item = &'a Parameter>) -> Self {
        let mut bag = Self::new();
        bag.extend(params.into_iter().cloned());
        bag
    }

    /// Insert or replace a string parameter.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let param = Parameter::new(name, value);
        self.0.insert(param.name.clone(), param);
    }

    pub fn insert(&mut self, param: Parameter) {
        self.0.insert(param.name.clone(), param);
    }

    pub fn extend(&mut self, params: impl IntoIterator<Item = Parameter>) {
        for p in params {
            self.insert(p);
        }
    }

    /// Overlay every parameter of `other` on top of this bag.
    pub fn overlay(&mut self, other: &ParameterBag) {
        for p in other.iter() {
            self.insert(p.clone());
        }
    }

    /// Exact-name value lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|p| p.value.as_str())
    }

    /// Lookup used by prerequisites: the exact name first, then the pipeline
    /// namespace (`cds.pip.<name>`), then the name stripped of that namespace.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        if let Some(v) = self.get(name) {
            return Some(v);
        }
        match name.strip_prefix(PIPELINE_NAMESPACE) {
            Some(raw) => self.get(raw),
            None => self.get(&format!("{PIPELINE_NAMESPACE}{name}")),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Parameter> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.0.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.0.values_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<Parameter> {
        self.0.into_values().collect()
    }
}

impl FromIterator<Parameter> for ParameterBag {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut bag = Self::new();
        bag.extend(iter);
        bag
    }
}

/// Merge the parameter layers of a build: pipeline defaults (published under
/// `cds.pip.`), application-pipeline defaults, then run parameters.
pub fn merge_build_parameters(
    pipeline_defaults: &[Parameter],
    application_defaults: &[Parameter],
    run_parameters: &[Parameter],
) -> ParameterBag {
    let mut bag = ParameterBag::new();
    for p in pipeline_defaults {
        let mut published = p.clone();
        if !published.name.starts_with(PIPELINE_NAMESPACE) {
            published.name = format!("{PIPELINE_NAMESPACE}{}", p.name);
        }
        bag.insert(published);
    }
    for layer in [application_defaults, run_parameters] {
        for p in layer {
            // Overrides of a pipeline parameter land on its published name.
            let published = format!("{PIPELINE_NAMESPACE}{}", p.name);
            if !p.name.starts_with(PIPELINE_NAMESPACE) && bag.contains(&published) {
                let mut overridden = p.clone();
                overridden.name = published;
                bag.insert(overridden);
            } else {
                bag.insert(p.clone());
            }
        }
    }
    bag
}
