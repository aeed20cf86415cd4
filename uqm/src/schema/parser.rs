//! Pipeline document parsing and soft validation.

use super::dag::topological_order;
use super::document::{Metadata, Pipeline, Step, ValidationResult};
use crate::core::StepKind;
use crate::errors::ParseError;
use crate::params::{referenced_parameters, ParameterDecl};
use indexmap::IndexMap;
use serde_json::Value as Json;
use std::collections::HashSet;
use tracing::debug;

/// Step count above which [`validate_schema`] warns.
pub const DEFAULT_MAX_STEPS_WARNING: usize = 50;

/// Parses a pipeline document given as JSON text.
///
/// # Errors
///
/// Returns a parse error if the text is not JSON or the document is invalid.
pub fn parse_str(text: &str) -> Result<Pipeline, ParseError> {
    let doc: Json = serde_json::from_str(text)
        .map_err(|e| ParseError::new(format!("invalid JSON: {e}")))?;
    parse(&doc)
}

/// Parses and orders a pipeline document.
///
/// # Errors
///
/// Returns the first problem found, carrying the offending field path.
pub fn parse(doc: &Json) -> Result<Pipeline, ParseError> {
    let mut state = DocumentParser::default();
    match state.run(doc) {
        Some(pipeline) if state.errors.is_empty() => Ok(pipeline),
        _ => Err(state
            .errors
            .into_iter()
            .next()
            .unwrap_or_else(|| ParseError::new("invalid pipeline document"))),
    }
}

/// Validates a document without running it, using the default step-count
/// warning threshold.
#[must_use]
pub fn validate_schema(doc: &Json) -> ValidationResult {
    validate_schema_with(doc, DEFAULT_MAX_STEPS_WARNING)
}

/// Validates a document, collecting every error found plus soft warnings.
#[must_use]
pub fn validate_schema_with(doc: &Json, max_steps_warning: usize) -> ValidationResult {
    let mut state = DocumentParser::default();
    let parsed = state.run(doc);

    let errors: Vec<_> = state.errors.iter().map(ParseError::to_issue).collect();
    let mut warnings = Vec::new();

    if let Some(pipeline) = parsed.as_ref().filter(|_| errors.is_empty()) {
        if pipeline.metadata.description.trim().is_empty() {
            warnings.push("Pipeline has no description".to_string());
        }

        let mut used = HashSet::new();
        for step in &pipeline.steps {
            used.extend(referenced_parameters(&step.config));
        }
        for decl in &pipeline.parameters {
            if !used.contains(&decl.name) {
                warnings.push(format!("Parameter '{}' is declared but never used", decl.name));
            }
        }

        if pipeline.steps.len() > max_steps_warning {
            warnings.push(format!(
                "Pipeline has {} steps (more than {max_steps_warning}); consider splitting it",
                pipeline.steps.len()
            ));
        }

        if state.output_defaulted {
            warnings.push(format!(
                "No output step given; defaulting to last step '{}'",
                pipeline.output
            ));
        }
    }

    ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[derive(Default)]
struct DocumentParser {
    errors: Vec<ParseError>,
    output_defaulted: bool,
}

impl DocumentParser {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>, value: Option<&Json>) {
        let mut err = ParseError::new(message).with_field(field);
        if let Some(value) = value {
            err = err.with_value(value.clone());
        }
        self.errors.push(err);
    }

    fn run(&mut self, doc: &Json) -> Option<Pipeline> {
        let Some(root) = doc.as_object() else {
            self.error("", "pipeline document must be an object", None);
            return None;
        };

        let metadata = match root.get("metadata") {
            None | Some(Json::Null) => Metadata::default(),
            Some(raw) => serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
                self.error("metadata", format!("invalid metadata: {e}"), Some(raw));
                Metadata::default()
            }),
        };

        let parameters = self.parameters(root.get("parameters"));
        let steps = self.steps(root.get("steps"));

        let output = match root.get("output") {
            None | Some(Json::Null) => {
                self.output_defaulted = true;
                steps.last().map(|s| s.name.clone()).unwrap_or_default()
            }
            Some(Json::String(name)) => {
                if !steps.is_empty() && !steps.iter().any(|s| &s.name == name) {
                    self.error(
                        "output",
                        format!("output references unknown step '{name}'"),
                        root.get("output"),
                    );
                }
                name.clone()
            }
            Some(other) => {
                self.error("output", "output must be a step name", Some(other));
                String::new()
            }
        };

        if !self.errors.is_empty() {
            return None;
        }

        let dependencies = self.dependencies(&steps);
        if !self.errors.is_empty() {
            return None;
        }

        let declared: Vec<String> = steps.iter().map(|s| s.name.clone()).collect();
        let execution_order = match topological_order(&declared, &dependencies) {
            Ok(order) => order,
            Err(cycle) => {
                self.errors.push(cycle.into());
                return None;
            }
        };

        debug!(
            pipeline = %metadata.name,
            steps = steps.len(),
            order = ?execution_order,
            "Parsed pipeline"
        );

        Some(Pipeline {
            metadata,
            parameters,
            steps,
            output,
            execution_order,
            dependencies,
        })
    }

    fn parameters(&mut self, raw: Option<&Json>) -> Vec<ParameterDecl> {
        let items = match raw {
            None | Some(Json::Null) => return Vec::new(),
            Some(Json::Array(items)) => items,
            Some(other) => {
                self.error("parameters", "parameters must be an array", Some(other));
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut decls = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match serde_json::from_value::<ParameterDecl>(item.clone()) {
                Ok(decl) if decl.name.trim().is_empty() => {
                    self.error(format!("parameters[{i}].name"), "parameter name is empty", Some(item));
                }
                Ok(decl) => {
                    if !seen.insert(decl.name.clone()) {
                        self.error(
                            format!("parameters[{i}].name"),
                            format!("duplicate parameter '{}'", decl.name),
                            Some(item),
                        );
                    }
                    decls.push(decl);
                }
                Err(e) => self.error(
                    format!("parameters[{i}]"),
                    format!("invalid parameter: {e}"),
                    Some(item),
                ),
            }
        }
        decls
    }

    fn steps(&mut self, raw: Option<&Json>) -> Vec<Step> {
        let items = match raw {
            Some(Json::Array(items)) if !items.is_empty() => items,
            Some(Json::Array(_)) => {
                self.error("steps", "pipeline must have at least one step", None);
                return Vec::new();
            }
            None | Some(Json::Null) => {
                self.error("steps", "steps is required", None);
                return Vec::new();
            }
            Some(other) => {
                self.error("steps", "steps must be an array", Some(other));
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let Some(obj) = item.as_object() else {
                self.error(format!("steps[{i}]"), "step must be an object", Some(item));
                continue;
            };

            let name = match obj.get("name") {
                Some(Json::String(name)) if !name.trim().is_empty() => name.clone(),
                other => {
                    self.error(format!("steps[{i}].name"), "step name is required", other);
                    continue;
                }
            };
            if !seen.insert(name.clone()) {
                self.error(
                    format!("steps[{i}].name"),
                    format!("duplicate step name '{name}'"),
                    obj.get("name"),
                );
            }

            let kind = match obj.get("type") {
                Some(Json::String(kind)) => match kind.parse::<StepKind>() {
                    Ok(kind) => kind,
                    Err(e) => {
                        self.errors.push(e.with_field(format!("steps[{i}].type")));
                        continue;
                    }
                },
                other => {
                    self.error(format!("steps[{i}].type"), "step type is required", other);
                    continue;
                }
            };

            let config = match obj.get("config") {
                Some(config @ Json::Object(_)) => config.clone(),
                None => {
                    self.error(format!("steps[{i}].config"), "step config is required", None);
                    continue;
                }
                Some(other) => {
                    self.error(format!("steps[{i}].config"), "step config must be an object", Some(other));
                    continue;
                }
            };

            let cache = match obj.get("cache") {
                None | Some(Json::Null) => true,
                Some(Json::Bool(flag)) => *flag,
                Some(other) => {
                    self.error(format!("steps[{i}].cache"), "cache must be a boolean", Some(other));
                    true
                }
            };

            steps.push(Step {
                name,
                kind,
                config,
                cache,
            });
        }
        steps
    }

    fn dependencies(&mut self, steps: &[Step]) -> IndexMap<String, Vec<String>> {
        let names: HashSet<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        let mut graph = IndexMap::with_capacity(steps.len());

        for (i, step) in steps.iter().enumerate() {
            let mut deps: Vec<String> = Vec::new();
            let mut add = |name: &str| {
                if !deps.iter().any(|d| d == name) {
                    deps.push(name.to_string());
                }
            };

            let config = &step.config;
            let mut strict = Vec::new();
            match config.get("source") {
                Some(Json::String(source)) => strict.push(("source".to_string(), source.as_str())),
                Some(Json::Array(list)) => {
                    for (j, v) in list.iter().enumerate() {
                        if let Some(s) = v.as_str() {
                            strict.push((format!("source[{j}]"), s));
                        }
                    }
                }
                _ => {}
            }
            match config.get("sources") {
                Some(Json::String(source)) => strict.push(("sources".to_string(), source.as_str())),
                Some(Json::Array(list)) => {
                    for (j, v) in list.iter().enumerate() {
                        match v.as_str() {
                            Some(s) => strict.push((format!("sources[{j}]"), s)),
                            None => self.error(
                                format!("steps[{i}].config.sources[{j}]"),
                                "source must be a step name",
                                Some(v),
                            ),
                        }
                    }
                }
                _ => {}
            }

            for (key, source) in strict {
                if names.contains(source) {
                    add(source);
                } else {
                    self.error(
                        format!("steps[{i}].config.{key}"),
                        format!("step '{}' references unknown step '{source}'", step.name),
                        Some(&Json::String(source.to_string())),
                    );
                }
            }

            for candidate in soft_references(step) {
                if candidate != step.name && names.contains(candidate) {
                    add(candidate);
                }
            }

            graph.insert(step.name.clone(), deps);
        }

        graph
    }
}

/// Kind-specific config keys that may name an upstream step, in which case
/// they add a dependency; otherwise they name an external table.
fn soft_references(step: &Step) -> Vec<&str> {
    let config = &step.config;
    let mut refs = Vec::new();
    match step.kind {
        StepKind::Query => {
            refs.extend(config.get("data_source").and_then(Json::as_str));
            if let Some(joins) = config.get("joins").and_then(Json::as_array) {
                refs.extend(joins.iter().filter_map(|j| j.get("table").and_then(Json::as_str)));
            }
        }
        StepKind::Enrich => {
            refs.extend(config.get("lookup").and_then(Json::as_str));
            refs.extend(
                config
                    .get("lookup")
                    .and_then(|l| l.get("step"))
                    .and_then(Json::as_str),
            );
        }
        StepKind::Assert => {
            if let Some(checks) = config.get("assertions").and_then(Json::as_array) {
                refs.extend(
                    checks
                        .iter()
                        .filter_map(|c| c.get("reference").and_then(Json::as_str)),
                );
            }
        }
        StepKind::Pivot | StepKind::Unpivot | StepKind::Union => {}
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc() -> Json {
        json!({
            "metadata": {"name": "sales", "description": "Sales report", "owner": "bi"},
            "parameters": [{"name": "region", "type": "string", "default": "EU"}],
            "steps": [
                {"name": "report", "type": "query", "config": {
                    "data_source": "joined", "metrics": [{"name": "n", "aggregation": "count"}]}},
                {"name": "orders", "type": "query", "config": {
                    "data_source": "orders_table",
                    "filters": [{"field": "region", "operator": "=", "value": "$region"}]}},
                {"name": "joined", "type": "enrich", "config": {
                    "source": "orders", "lookup": "customers", "on": "customer_id"}},
                {"name": "customers", "type": "query", "config": {"data_source": "customers"}}
            ],
            "output": "report"
        })
    }

    #[test]
    fn test_parse_orders_dependencies_first() {
        let pipeline = parse(&doc()).unwrap();

        assert_eq!(pipeline.metadata.name, "sales");
        assert_eq!(pipeline.metadata.version, "1.0.0");
        assert_eq!(pipeline.metadata.extra.get("owner"), Some(&json!("bi")));
        assert_eq!(pipeline.dependencies_of("joined"), ["orders", "customers"]);
        assert_eq!(pipeline.dependencies_of("customers"), [] as [String; 0]);
        assert_eq!(
            pipeline.execution_order,
            vec!["orders", "customers", "joined", "report"]
        );
    }

    #[test]
    fn test_error_field_paths() {
        let cases = [
            (json!({"steps": []}), "steps"),
            (
                json!({"steps": [{"name": "a", "type": "query", "config": {}},
                                 {"name": "b", "type": "explode", "config": {}}]}),
                "steps[1].type",
            ),
            (
                json!({"steps": [{"name": "a", "type": "query", "config": {}},
                                 {"name": "a", "type": "query", "config": {}}]}),
                "steps[1].name",
            ),
            (
                json!({"steps": [{"name": "a", "type": "union", "config": {"sources": ["x"]}}]}),
                "steps[0].config.sources[0]",
            ),
            (
                json!({"steps": [{"name": "a", "type": "query", "config": {}}], "output": "zz"}),
                "output",
            ),
            (
                json!({"steps": [{"name": "a", "type": "query", "config": []}]}),
                "steps[0].config",
            ),
        ];

        for (doc, field) in cases {
            let err = parse(&doc).unwrap_err();
            assert_eq!(err.field.as_deref(), Some(field), "{doc}");
        }
    }

    #[test]
    fn test_cycle_fails_parse() {
        let doc = json!({"steps": [
            {"name": "a", "type": "union", "config": {"sources": ["b"]}},
            {"name": "b", "type": "union", "config": {"sources": ["a"]}}
        ]});
        let err = parse(&doc).unwrap_err();
        assert_eq!(err.field.as_deref(), Some("steps"));
        assert!(err.message.contains("a -> b -> a"), "{}", err.message);
    }

    #[test]
    fn test_output_defaults_to_last_step() {
        let doc = json!({"steps": [
            {"name": "a", "type": "query", "config": {"data_source": "t"}},
            {"name": "b", "type": "query", "config": {"data_source": "a"}}
        ]});
        let pipeline = parse(&doc).unwrap();
        assert_eq!(pipeline.output, "b");
        assert_eq!(pipeline.metadata.name, "unnamed_pipeline");
    }

    #[test]
    fn test_validate_schema_warnings() {
        let sparse = json!({
            "parameters": [{"name": "unused"}],
            "steps": [{"name": "a", "type": "query", "config": {"data_source": "t"}}]
        });
        let result = validate_schema(&sparse);

        assert!(result.valid);
        assert_eq!(result.warnings.len(), 3);
        assert!(result.warnings.iter().any(|w| w.contains("'unused'")));
        assert!(result.warnings.iter().any(|w| w.contains("description")));
        assert!(result.warnings.iter().any(|w| w.contains("defaulting")));

        let crowded = validate_schema_with(&doc(), 2);
        assert!(crowded.warnings.iter().any(|w| w.contains("4 steps")));
    }

    #[test]
    fn test_validate_schema_collects_errors() {
        let doc = json!({"steps": [
            {"name": "a", "type": "bogus", "config": {}},
            {"type": "query", "config": {}}
        ]});
        let result = validate_schema(&doc);

        assert!(!result.valid);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["steps[0].type", "steps[1].name"]);
    }
}
