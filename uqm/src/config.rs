//! Engine configuration and per-call execution options.

use crate::errors::{UqmError, UqmResult, ValidationError};
use crate::sql::SqlDialect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What happens when a calculated-field expression fails on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionFailurePolicy {
    /// The field becomes null and a warning is logged.
    #[default]
    Null,
    /// The step fails.
    Error,
}

impl fmt::Display for ExpressionFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Error => f.write_str("error"),
        }
    }
}

impl FromStr for ExpressionFailurePolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "null" => Ok(Self::Null),
            "error" => Ok(Self::Error),
            _ => Err(ValidationError::single(
                "expression_failure",
                format!("expected 'null' or 'error', got '{s}'"),
            )),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_step_cache_ttl() -> u64 {
    300
}

fn default_pipeline_cache_ttl() -> u64 {
    300
}

fn default_max_steps_warning() -> usize {
    crate::schema::DEFAULT_MAX_STEPS_WARNING
}

fn default_page_size() -> u64 {
    100
}

fn default_max_page_size() -> u64 {
    10_000
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dialect used when no connector is attached.
    #[serde(default)]
    pub dialect: SqlDialect,
    /// Whether step outputs are cached.
    #[serde(default = "default_true")]
    pub step_cache_enabled: bool,
    /// Step cache TTL in seconds.
    #[serde(default = "default_step_cache_ttl")]
    pub step_cache_ttl_seconds: u64,
    /// Whether whole results are cached.
    #[serde(default = "default_true")]
    pub pipeline_cache_enabled: bool,
    /// Pipeline cache TTL in seconds.
    #[serde(default = "default_pipeline_cache_ttl")]
    pub pipeline_cache_ttl_seconds: u64,
    /// Keep running independent steps after a failure.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Default calculated-field failure policy.
    #[serde(default)]
    pub expression_failure: ExpressionFailurePolicy,
    /// Step count above which validation warns.
    #[serde(default = "default_max_steps_warning")]
    pub max_steps_warning: usize,
    /// Page size used when a page is requested without a size.
    #[serde(default = "default_page_size")]
    pub default_page_size: u64,
    /// Largest accepted page size.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::default(),
            step_cache_enabled: true,
            step_cache_ttl_seconds: default_step_cache_ttl(),
            pipeline_cache_enabled: true,
            pipeline_cache_ttl_seconds: default_pipeline_cache_ttl(),
            continue_on_error: false,
            expression_failure: ExpressionFailurePolicy::default(),
            max_steps_warning: default_max_steps_warning(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON configuration; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns a serialization error for malformed JSON and a validation
    /// error for inconsistent values.
    pub fn from_json_str(text: &str) -> UqmResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings for consistency.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending setting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_page_size == 0 {
            return Err(ValidationError::single("max_page_size", "must be positive"));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(ValidationError::single(
                "default_page_size",
                format!("must be between 1 and max_page_size ({})", self.max_page_size),
            ));
        }
        Ok(())
    }

    /// Sets the dialect.
    #[must_use]
    pub fn with_dialect(mut self, dialect: SqlDialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Enables or disables the step cache.
    #[must_use]
    pub fn with_step_cache(mut self, enabled: bool) -> Self {
        self.step_cache_enabled = enabled;
        self
    }

    /// Enables or disables the pipeline cache.
    #[must_use]
    pub fn with_pipeline_cache(mut self, enabled: bool) -> Self {
        self.pipeline_cache_enabled = enabled;
        self
    }

    /// Sets the default failure mode.
    #[must_use]
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Sets the default calculated-field failure policy.
    #[must_use]
    pub fn with_expression_failure(mut self, policy: ExpressionFailurePolicy) -> Self {
        self.expression_failure = policy;
        self
    }

    /// Step cache TTL.
    #[must_use]
    pub fn step_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.step_cache_ttl_seconds)
    }

    /// Pipeline cache TTL.
    #[must_use]
    pub fn pipeline_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pipeline_cache_ttl_seconds)
    }
}

/// Options for a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Use caches for this run (`None` follows the engine config).
    #[serde(default)]
    pub use_cache: Option<bool>,
    /// Override the engine's failure mode.
    #[serde(default)]
    pub continue_on_error: Option<bool>,
    /// 1-based page number.
    #[serde(default)]
    pub page: Option<u64>,
    /// Rows per page.
    #[serde(default)]
    pub page_size: Option<u64>,
}

impl ExecutionOptions {
    /// Options that follow the engine defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables caching for the run.
    #[must_use]
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }

    /// Overrides the failure mode for the run.
    #[must_use]
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = Some(continue_on_error);
        self
    }

    /// Requests one page of the output.
    #[must_use]
    pub fn with_page(mut self, page: u64, page_size: u64) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    /// Resolves the requested page into `(page, page_size)`.
    ///
    /// Returns `None` when no pagination was requested.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero page or an oversized page.
    pub fn pagination(&self, config: &EngineConfig) -> UqmResult<Option<(u64, u64)>> {
        if self.page.is_none() && self.page_size.is_none() {
            return Ok(None);
        }
        let page = self.page.unwrap_or(1);
        let page_size = self.page_size.unwrap_or(config.default_page_size);
        if page == 0 {
            return Err(UqmError::Validation(ValidationError::single(
                "page",
                "must be 1 or greater",
            )));
        }
        if page_size == 0 || page_size > config.max_page_size {
            return Err(UqmError::Validation(ValidationError::single(
                "page_size",
                format!("must be between 1 and {}", config.max_page_size),
            )));
        }
        Ok(Some((page, page_size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_json_defaults() {
        let config = EngineConfig::from_json_str(r#"{"dialect": "postgres", "continue_on_error": true}"#)
            .unwrap();

        assert_eq!(config.dialect, SqlDialect::Postgres);
        assert!(config.continue_on_error);
        assert!(config.step_cache_enabled);
        assert_eq!(config.max_steps_warning, 50);
        assert_eq!(config.default_page_size, 100);
    }

    #[test]
    fn test_invalid_config() {
        assert!(EngineConfig::from_json_str(r#"{"default_page_size": 0}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"expression_failure": "explode"}"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_pagination_resolution() {
        let config = EngineConfig::default();
        assert_eq!(ExecutionOptions::new().pagination(&config).unwrap(), None);
        assert_eq!(
            ExecutionOptions {
                page: Some(3),
                ..ExecutionOptions::default()
            }
            .pagination(&config)
            .unwrap(),
            Some((3, 100))
        );
        assert!(ExecutionOptions::new().with_page(0, 10).pagination(&config).is_err());
        assert!(ExecutionOptions::new()
            .with_page(1, 20_000)
            .pagination(&config)
            .is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("ERROR".parse::<ExpressionFailurePolicy>().unwrap(), ExpressionFailurePolicy::Error);
        assert!("skip".parse::<ExpressionFailurePolicy>().is_err());
    }
}
