//! Sequential pipeline executor.
//!
//! Steps run one at a time in topological order. Each step reads the row
//! sets of its dependencies from the run's result map, and its own rows are
//! stored before the next step starts.

mod failure;

pub use failure::{FailureCollector, FailureMode, FailureRecord};

use crate::cache::{rows_fingerprint, step_cache_key, CacheBackend};
use crate::config::EngineConfig;
use crate::connectors::Connector;
use crate::core::{Parameters, RowSet, StepKind, StepStatus};
use crate::errors::UqmResult;
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::observability::StepTimer;
use crate::schema::{Pipeline, Step};
use crate::sql::SqlDialect;
use crate::steps::{Pagination, StepContext, StepOutput, StepRegistry};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name.
    pub step_name: String,
    /// Step type.
    pub step_type: StepKind,
    /// Final status.
    pub status: StepStatus,
    /// Rows produced.
    pub row_count: usize,
    /// Wall time in milliseconds.
    pub execution_time: f64,
    /// Served from the step cache.
    pub cache_hit: bool,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal problems.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Kind-specific details such as generated SQL or assertion results.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl StepResult {
    fn skipped(step: &Step) -> Self {
        Self {
            step_name: step.name.clone(),
            step_type: step.kind,
            status: StepStatus::Skipped,
            row_count: 0,
            execution_time: 0.0,
            cache_hit: false,
            error: None,
            warnings: Vec::new(),
            details: serde_json::Value::Null,
        }
    }
}

/// Per-run settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSettings {
    /// Use the step cache.
    pub use_cache: bool,
    /// Failure handling.
    pub failure_mode: FailureMode,
    /// Pagination pushed into the output step.
    pub pagination: Option<Pagination>,
}

/// Everything a run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Outputs of the steps that succeeded, in execution order.
    pub outputs: IndexMap<String, StepOutput>,
    /// One result per step, in execution order.
    pub step_results: Vec<StepResult>,
    /// Failures in the order they happened.
    pub failures: Vec<FailureRecord>,
}

impl RunOutcome {
    /// Output of a step that succeeded.
    #[must_use]
    pub fn output(&self, step: &str) -> Option<&StepOutput> {
        self.outputs.get(step)
    }

    /// Whether any step was served from the step cache.
    #[must_use]
    pub fn any_cache_hit(&self) -> bool {
        self.step_results.iter().any(|r| r.cache_hit)
    }
}

/// Runs parsed pipelines.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<StepRegistry>,
    connector: Option<Arc<dyn Connector>>,
    cache: Option<Arc<dyn CacheBackend>>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("has_connector", &self.connector.is_some())
            .field("has_cache", &self.cache.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Executor {
    /// Creates an executor with the built-in step engines and no connector,
    /// cache or event sink.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(StepRegistry::with_defaults()),
            connector: None,
            cache: None,
            events: Arc::new(NoOpEventSink),
            config,
        }
    }

    /// Replaces the step registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Sets the database connector.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets the cache backend.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The connector, if any.
    #[must_use]
    pub fn connector(&self) -> Option<&Arc<dyn Connector>> {
        self.connector.as_ref()
    }

    /// The cache backend, if any.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Dialect used for generated SQL.
    #[must_use]
    pub fn dialect(&self) -> SqlDialect {
        self.connector
            .as_ref()
            .map_or(self.config.dialect, |c| c.dialect())
    }

    /// Runs every step of a resolved pipeline.
    ///
    /// Step failures never escape as errors; they are recorded in the
    /// outcome according to the failure mode.
    pub async fn run(&self, pipeline: &Pipeline, params: &Parameters, settings: RunSettings) -> RunOutcome {
        let params = Arc::new(params.clone());
        let mut collector = FailureCollector::new(settings.failure_mode);
        let mut results: IndexMap<String, Arc<RowSet>> = IndexMap::new();
        let mut outcome = RunOutcome::default();

        let steps: Vec<&Step> = pipeline.ordered_steps().collect();
        for (position, step) in steps.iter().enumerate() {
            if collector.should_stop() {
                for skipped in &steps[position..] {
                    debug!(step = %skipped.name, "Skipping step after failure");
                    outcome.step_results.push(StepResult::skipped(skipped));
                }
                break;
            }

            let dependencies = pipeline.dependencies_of(&step.name);
            if let Some(failed) = collector.failed_dependency(dependencies) {
                debug!(step = %step.name, dependency = failed, "Dependency failed; step will fail reading it");
            }

            let mut ctx = StepContext::new(&step.name, step.kind, step.config.clone());
            ctx.upstream = dependencies.to_vec();
            for dep in dependencies {
                if let Some(rows) = results.get(dep) {
                    ctx.inputs.insert(dep.clone(), Arc::clone(rows));
                }
            }
            ctx.params = Arc::clone(&params);
            ctx.connector = self.connector.clone();
            ctx.dialect = self.dialect();
            ctx.expression_failure = self.config.expression_failure;
            if step.name == pipeline.output && step.kind == StepKind::Query {
                ctx.pagination = settings.pagination;
            }

            let span = info_span!("uqm.step", step = %step.name, step_type = %step.kind);
            let result = self.run_step(step, &ctx, settings.use_cache).instrument(span).await;

            match result {
                Ok((output, step_result)) => {
                    collector.record_completion(&step.name);
                    results.insert(step.name.clone(), Arc::new(output.rows.clone()));
                    outcome.outputs.insert(step.name.clone(), output);
                    outcome.step_results.push(step_result);
                }
                Err(step_result) => {
                    let message = step_result.error.clone().unwrap_or_default();
                    collector.record_failure(
                        FailureRecord::new(&step.name, step.kind.as_str(), message)
                            .with_error_type(step_result.details["error_type"].as_str().unwrap_or("ExecutionError")),
                    );
                    outcome.step_results.push(StepResult {
                        details: serde_json::Value::Null,
                        ..step_result
                    });
                }
            }
        }

        outcome.failures = collector.into_failures();
        outcome
    }

    fn step_cache_material(ctx: &StepContext) -> Vec<String> {
        ctx.upstream
            .iter()
            .map(|dep| match ctx.inputs.get(dep) {
                Some(rows) => format!("{dep}:{}", rows_fingerprint(rows)),
                None => format!("{dep}:missing"),
            })
            .collect()
    }

    async fn cached_output(&self, key: &str) -> Option<StepOutput> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(output) => Some(output),
                Err(err) => {
                    warn!(key, error = %err, "Discarding unreadable step cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "Step cache read failed; treating as miss");
                None
            }
        }
    }

    async fn store_output(&self, key: &str, output: &StepOutput) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let value = match serde_json::to_value(output) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "Step output is not cacheable");
                return;
            }
        };
        if let Err(err) = cache.set(key, value, Some(self.config.step_cache_ttl())).await {
            warn!(key, error = %err, "Step cache write failed");
        }
    }

    /// Runs one step, consulting the step cache.
    ///
    /// The error side carries the failed step's result.
    async fn run_step(
        &self,
        step: &Step,
        ctx: &StepContext,
        use_cache: bool,
    ) -> Result<(StepOutput, StepResult), StepResult> {
        let timer = StepTimer::start(&step.name);
        let step_type = step.kind.as_str();
        self.events
            .emit(event_types::STEP_STARTED, Some(json!({"step": step.name, "step_type": step_type})))
            .await;

        let cacheable = use_cache
            && self.config.step_cache_enabled
            && step.cache
            && self.cache.is_some()
            && ctx.pagination.is_none();
        let key = cacheable.then(|| step_cache_key(step_type, &step.config, &Self::step_cache_material(ctx)));

        if let Some(key) = &key {
            if let Some(output) = self.cached_output(key).await {
                let execution_time = timer.finish();
                debug!(rows = output.rows.len(), "Step served from cache");
                self.events
                    .emit(
                        event_types::STEP_CACHE_HIT,
                        Some(json!({"step": step.name, "step_type": step_type, "row_count": output.rows.len()})),
                    )
                    .await;
                let result = StepResult {
                    step_name: step.name.clone(),
                    step_type: step.kind,
                    status: StepStatus::Success,
                    row_count: output.rows.len(),
                    execution_time,
                    cache_hit: true,
                    error: None,
                    warnings: output.warnings.clone(),
                    details: output.details.clone(),
                };
                return Ok((output, result));
            }
        }

        let outcome: UqmResult<StepOutput> = match self.registry.get(step.kind) {
            Ok(engine) => engine.execute(ctx).await,
            Err(err) => Err(err),
        };
        let execution_time = timer.finish();

        match outcome {
            Ok(output) => {
                info!(rows = output.rows.len(), duration_ms = execution_time, "Step completed");
                self.events
                    .emit(
                        event_types::STEP_COMPLETED,
                        Some(json!({
                            "step": step.name,
                            "step_type": step_type,
                            "row_count": output.rows.len(),
                            "duration_ms": execution_time,
                        })),
                    )
                    .await;
                if let Some(key) = &key {
                    self.store_output(key, &output).await;
                }
                let result = StepResult {
                    step_name: step.name.clone(),
                    step_type: step.kind,
                    status: StepStatus::Success,
                    row_count: output.rows.len(),
                    execution_time,
                    cache_hit: false,
                    error: None,
                    warnings: output.warnings.clone(),
                    details: output.details.clone(),
                };
                Ok((output, result))
            }
            Err(err) => {
                let error_type = err.error_type();
                let error = err.in_step(&step.name, step_type);
                warn!(error = %error, duration_ms = execution_time, "Step failed");
                self.events
                    .emit(
                        event_types::STEP_FAILED,
                        Some(json!({"step": step.name, "step_type": step_type, "error": error.to_string()})),
                    )
                    .await;
                Err(StepResult {
                    step_name: step.name.clone(),
                    step_type: step.kind,
                    status: StepStatus::Failed,
                    row_count: 0,
                    execution_time,
                    cache_hit: false,
                    error: Some(error.message),
                    warnings: Vec::new(),
                    details: json!({"error_type": error_type}),
                })
            }
        }
    }
}
