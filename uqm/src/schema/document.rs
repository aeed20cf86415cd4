//! Parsed pipeline document types.

use crate::core::StepKind;
use crate::errors::ValidationIssue;
use crate::params::ParameterDecl;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

fn default_name() -> String {
    "unnamed_pipeline".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Descriptive pipeline metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Pipeline name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Document version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Author, if given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Any other keys, preserved as given.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: String::new(),
            version: default_version(),
            author: None,
            tags: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// A named unit of work in a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step name.
    pub name: String,
    /// What the step does.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Kind-specific configuration object.
    pub config: serde_json::Value,
    /// Whether the step's result may be cached.
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Step {
    /// Creates a cacheable step.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StepKind, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            kind,
            config,
            cache: true,
        }
    }

    /// Reads a string config key.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(serde_json::Value::as_str)
    }
}

/// A parsed, dependency-ordered pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Descriptive metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Declared parameters, in document order.
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
    /// Steps, in document order.
    pub steps: Vec<Step>,
    /// Name of the step whose rows are the pipeline result.
    pub output: String,
    /// Steps in execution order (dependencies first).
    #[serde(default, skip_serializing)]
    pub execution_order: Vec<String>,
    /// Upstream step names per step.
    #[serde(default, skip_serializing)]
    pub dependencies: IndexMap<String, Vec<String>>,
}

impl Pipeline {
    /// Looks up a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Returns the upstream steps of `name`.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map_or(&[][..], Vec::as_slice)
    }

    /// Iterates steps in execution order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.execution_order.iter().filter_map(|name| self.step(name))
    }

    /// Converts back to document JSON.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Outcome of [`validate_schema`](crate::schema::validate_schema).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the document parsed without errors.
    pub valid: bool,
    /// Hard errors.
    pub errors: Vec<ValidationIssue>,
    /// Soft warnings.
    pub warnings: Vec<String>,
}
