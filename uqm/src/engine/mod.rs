//! Pipeline engine: the entry point that parses, resolves, caches and runs
//! UQM documents.
//!
//! One call to [`PipelineEngine::execute`] goes through:
//!
//! 1. parse the document and compute the execution order;
//! 2. validate supplied parameters and apply defaults;
//! 3. drop filters whose conditional gates are false;
//! 4. substitute `$name` placeholders into a resolved copy;
//! 5. consult the pipeline cache;
//! 6. run the steps through the [`Executor`];
//! 7. page the output rows and assemble the [`ExecutionResult`].


use crate::cache::{pipeline_cache_key, CacheBackend};
use crate::config::{EngineConfig, ExecutionOptions};
use crate::connectors::Connector;
use crate::core::{Parameters, RowSet, StepKind, StepStatus};
use crate::errors::{ExecutionError, UqmResult};
use crate::events::{event_types, EventSink};
use crate::executor::{Executor, FailureMode, FailureRecord, RunSettings, StepResult};
use crate::params::{resolve_conditional_filters, resolve_parameters, substitute};
use crate::schema::{parse, validate_schema_with, Pipeline, ValidationResult};
use crate::steps::{preview_sql, Pagination, StepRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Identifies the run that produced a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Pipeline name.
    pub name: String,
    /// Pipeline version.
    pub version: String,
    /// Unique id of the run.
    pub run_id: String,
    /// Output step.
    pub output: String,
    /// When the run started.
    pub executed_at: DateTime<Utc>,
}

/// Run-level timing and counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Wall time of the whole call in milliseconds.
    pub total_time: f64,
    /// Rows returned.
    pub row_count: usize,
    /// Served from the pipeline cache.
    pub cache_hit: bool,
    /// Steps that ran (succeeded or failed).
    pub steps_executed: usize,
}

/// Page of the output that was returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationInfo {
    /// 1-based page number.
    pub page: u64,
    /// Rows per page.
    pub page_size: u64,
    /// Rows across all pages.
    pub total_count: u64,
    /// Number of pages.
    pub total_pages: u64,
    /// A later page exists.
    pub has_next: bool,
    /// An earlier page exists.
    pub has_previous: bool,
}

impl PaginationInfo {
    /// Describes `page` of `total_count` rows.
    #[must_use]
    pub fn new(page: u64, page_size: u64, total_count: u64) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total_count.div_ceil(page_size)
        };
        Self {
            page,
            page_size,
            total_count,
            total_pages,
            has_next: page < total_pages,
            has_previous: page > 1,
        }
    }
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the run produced its output.
    pub success: bool,
    /// Output rows (one page when paginated).
    pub data: RowSet,
    /// Run identification.
    pub metadata: ResultMetadata,
    /// Timing and counters.
    pub execution_info: ExecutionInfo,
    /// One entry per step, in execution order.
    pub step_results: Vec<StepResult>,
    /// Page information when a page was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationInfo>,
    /// Step failures.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FailureRecord>,
}

impl ExecutionResult {
    /// Result of a named step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_name == name)
    }

    /// First failure message, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.errors.first().map(|f| f.message.as_str())
    }

    /// Converts a failed run into its first step error.
    ///
    /// # Errors
    ///
    /// Returns the first failure, attributed to its step, when the run did
    /// not succeed.
    pub fn into_result(self) -> Result<Self, ExecutionError> {
        if self.success {
            return Ok(self);
        }
        Err(self.errors.first().map_or_else(
            || ExecutionError::new(format!("Pipeline produced no rows for output '{}'", self.metadata.output)),
            FailureRecord::to_error,
        ))
    }
}

/// One step of an [`ExecutionPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    /// Step name.
    pub name: String,
    /// Step type.
    pub step_type: StepKind,
    /// Upstream steps.
    pub depends_on: Vec<String>,
    /// SQL the step would send, for table-backed queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// What a run would do, without running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Pipeline name.
    pub pipeline: String,
    /// Output step.
    pub output: String,
    /// Steps in execution order.
    pub steps: Vec<PlannedStep>,
}

/// Parses, resolves and runs UQM pipelines.
#[derive(Debug)]
pub struct PipelineEngine {
    executor: Executor,
    connected: AtomicBool,
}

impl Default for PipelineEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl PipelineEngine {
    /// Creates an engine with the built-in step engines.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            executor: Executor::new(config),
            connected: AtomicBool::new(false),
        }
    }

    /// Replaces the step registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.executor = self.executor.with_registry(registry);
        self
    }

    /// Sets the database connector.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.executor = self.executor.with_connector(connector);
        self.connected = AtomicBool::new(false);
        self
    }

    /// Sets the cache backend used by both cache layers.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.executor = self.executor.with_cache(cache);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(events);
        self
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    /// The underlying executor.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Validates a document without running it.
    #[must_use]
    pub fn validate(&self, document: &Json) -> ValidationResult {
        validate_schema_with(document, self.config().max_steps_warning)
    }

    /// Describes the steps a run would execute, with previewed SQL.
    ///
    /// # Errors
    ///
    /// Returns parse, parameter or config errors.
    pub fn explain(&self, document: &Json, params: &Parameters) -> UqmResult<ExecutionPlan> {
        let (pipeline, _) = Self::resolve(document, params)?;
        let dialect = self.executor.dialect();

        let steps = pipeline
            .ordered_steps()
            .map(|step| -> UqmResult<PlannedStep> {
                let depends_on = pipeline.dependencies_of(&step.name).to_vec();
                let sql = match step.kind {
                    StepKind::Query => preview_sql(&step.config, &depends_on, dialect)?,
                    _ => None,
                };
                Ok(PlannedStep {
                    name: step.name.clone(),
                    step_type: step.kind,
                    depends_on,
                    sql,
                })
            })
            .collect::<UqmResult<Vec<_>>>()?;

        Ok(ExecutionPlan {
            pipeline: pipeline.metadata.name.clone(),
            output: pipeline.output.clone(),
            steps,
        })
    }

    /// Parses the document and resolves parameters into a runnable copy.
    fn resolve(document: &Json, params: &Parameters) -> UqmResult<(Pipeline, Parameters)> {
        let pipeline = parse(document)?;
        let params = resolve_parameters(&pipeline.parameters, params)?;
        let gated = resolve_conditional_filters(&pipeline, &params)?;
        Ok((substitute(&gated, &params), params))
    }

    /// Runs a document.
    ///
    /// Step failures are reported inside the result; use
    /// [`ExecutionResult::into_result`] to turn them into an error.
    ///
    /// # Errors
    ///
    /// Returns parse and validation errors, which surface before any step
    /// runs, and connection errors from connecting the connector.
    pub async fn execute(
        &self,
        document: &Json,
        params: Parameters,
        options: ExecutionOptions,
    ) -> UqmResult<ExecutionResult> {
        let started = Instant::now();
        let page = options.pagination(self.config())?;
        let (pipeline, params) = Self::resolve(document, &params)?;

        let span = info_span!("uqm.pipeline", pipeline = %pipeline.metadata.name);
        self.run_resolved(&pipeline, &params, &options, page, started)
            .instrument(span)
            .await
    }

    async fn run_resolved(
        &self,
        pipeline: &Pipeline,
        params: &Parameters,
        options: &ExecutionOptions,
        page: Option<(u64, u64)>,
        started: Instant,
    ) -> UqmResult<ExecutionResult> {
        let config = self.config();
        let use_cache = options.use_cache.unwrap_or(true);
        let failure_mode =
            FailureMode::from_flag(options.continue_on_error.unwrap_or(config.continue_on_error));

        let cache_key = (use_cache && config.pipeline_cache_enabled && self.executor.cache().is_some())
            .then(|| pipeline_cache_key(&pipeline.to_json(), params, page.map(|p| p.0), page.map(|p| p.1)));

        if let Some(key) = &cache_key {
            if let Some(mut cached) = self.cached_result(key).await {
                cached.execution_info.cache_hit = true;
                cached.execution_info.total_time = elapsed_ms(started);
                info!(run_id = %cached.metadata.run_id, rows = cached.data.len(), "Pipeline served from cache");
                self.executor
                    .events()
                    .emit(
                        event_types::PIPELINE_COMPLETED,
                        Some(json!({
                            "pipeline": pipeline.metadata.name,
                            "run_id": cached.metadata.run_id,
                            "row_count": cached.data.len(),
                            "cache_hit": true,
                        })),
                    )
                    .await;
                return Ok(cached);
            }
        }

        self.ensure_connected().await?;

        let run_id = Uuid::new_v4().to_string();
        let executed_at = Utc::now();
        info!(%run_id, steps = pipeline.steps.len(), ?failure_mode, "Pipeline started");
        self.executor
            .events()
            .emit(
                event_types::PIPELINE_STARTED,
                Some(json!({
                    "pipeline": pipeline.metadata.name,
                    "run_id": run_id,
                    "steps": pipeline.execution_order,
                })),
            )
            .await;

        let settings = RunSettings {
            use_cache,
            failure_mode,
            pagination: page.map(|(number, size)| Pagination::page(number, size)),
        };
        let outcome = self.executor.run(pipeline, params, settings).await;

        let output = outcome.output(&pipeline.output);
        let success = match failure_mode {
            FailureMode::FailFast => outcome.failures.is_empty(),
            FailureMode::ContinueOnError => output.is_some(),
        };

        let (data, pagination) = match (output, page) {
            (None, _) => (Vec::new(), None),
            (Some(output), None) => (output.rows.clone(), None),
            (Some(output), Some((number, size))) => match output.total_count {
                Some(total) => (output.rows.clone(), Some(PaginationInfo::new(number, size, total))),
                None => {
                    let window = Pagination::page(number, size);
                    let total = output.rows.len() as u64;
                    let rows = output
                        .rows
                        .iter()
                        .skip(usize::try_from(window.offset).unwrap_or(usize::MAX))
                        .take(usize::try_from(window.limit).unwrap_or(usize::MAX))
                        .cloned()
                        .collect();
                    (rows, Some(PaginationInfo::new(number, size, total)))
                }
            },
        };

        let steps_executed = outcome
            .step_results
            .iter()
            .filter(|r| r.status != StepStatus::Skipped)
            .count();
        let result = ExecutionResult {
            success,
            execution_info: ExecutionInfo {
                total_time: elapsed_ms(started),
                row_count: data.len(),
                cache_hit: false,
                steps_executed,
            },
            data,
            metadata: ResultMetadata {
                name: pipeline.metadata.name.clone(),
                version: pipeline.metadata.version.clone(),
                run_id: run_id.clone(),
                output: pipeline.output.clone(),
                executed_at,
            },
            step_results: outcome.step_results,
            pagination,
            errors: outcome.failures,
        };

        if result.success {
            info!(
                %run_id,
                rows = result.execution_info.row_count,
                duration_ms = result.execution_info.total_time,
                "Pipeline completed"
            );
            if let Some(key) = cache_key.as_deref().filter(|_| result.errors.is_empty()) {
                self.store_result(key, &result).await;
            }
            self.executor
                .events()
                .emit(
                    event_types::PIPELINE_COMPLETED,
                    Some(json!({
                        "pipeline": result.metadata.name,
                        "run_id": run_id,
                        "row_count": result.execution_info.row_count,
                        "duration_ms": result.execution_info.total_time,
                        "failed_steps": result.errors.len(),
                    })),
                )
                .await;
        } else {
            warn!(%run_id, error = ?result.error(), "Pipeline failed");
            self.executor
                .events()
                .emit(
                    event_types::PIPELINE_FAILED,
                    Some(json!({
                        "pipeline": result.metadata.name,
                        "run_id": run_id,
                        "error": result.error(),
                        "failed_steps": result.errors.len(),
                    })),
                )
                .await;
        }

        Ok(result)
    }

    async fn ensure_connected(&self) -> UqmResult<()> {
        let Some(connector) = self.executor.connector() else {
            return Ok(());
        };
        if !self.connected.load(Ordering::SeqCst) {
            connector.connect().await?;
            self.connected.store(true, Ordering::SeqCst);
            debug!("Connector connected");
        }
        Ok(())
    }

    async fn cached_result(&self, key: &str) -> Option<ExecutionResult> {
        let cache = self.executor.cache()?;
        match cache.get(key).await {
            Ok(Some(value)) => serde_json::from_value(value)
                .map_err(|err| warn!(key, error = %err, "Discarding unreadable pipeline cache entry"))
                .ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "Pipeline cache read failed; treating as miss");
                None
            }
        }
    }

    async fn store_result(&self, key: &str, result: &ExecutionResult) {
        let Some(cache) = self.executor.cache() else {
            return;
        };
        match serde_json::to_value(result) {
            Ok(value) => {
                if let Err(err) = cache.set(key, value, Some(self.config().pipeline_cache_ttl())).await {
                    warn!(key, error = %err, "Pipeline cache write failed");
                }
            }
            Err(err) => warn!(key, error = %err, "Pipeline result is not cacheable"),
        }
    }

    /// Closes the connector, if one is attached.
    ///
    /// # Errors
    ///
    /// Returns the connector's close error.
    pub async fn close(&self) -> UqmResult<()> {
        if let Some(connector) = self.executor.connector() {
            connector.close().await?;
            self.connected.store(false, Ordering::SeqCst);
            debug!("Connector closed");
        }
        Ok(())
    }
}

#[allow(clippy::cast_precision_loss)]
fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_micros() as f64 / 1000.0
}
