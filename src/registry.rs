//! Step executor registry: maps a step type name to a pluggable executor.
//!
//! Adapted from the engine's workflow-registry idiom of registering
//! type-erased factories by string key, generalized here from "one Rust
//! type per workflow" to "one step-type string per executor value".

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::workflow::StepDefinition;

/// Failure returned by a step executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepFailure {}

/// Successful executor outcome, with optional captured outputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub outputs: BTreeMap<String, String>,
}

/// A resource registered by an executor via `registerResource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredResource {
    pub name: String,
    pub resource_type: String,
    pub attributes: BTreeMap<String, String>,
}

/// Execution context handle passed to a step executor: read-only helpers
/// plus the two writers the distilled spec grants executors.
pub struct StepExecutionContext<'a> {
    pub step: &'a StepDefinition,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub env: BTreeMap<String, String>,
    pub cancellation: CancellationToken,
    pub deadline: Instant,
    emitted: parking_lot::Mutex<BTreeMap<String, String>>,
    resources: parking_lot::Mutex<Vec<RegisteredResource>>,
}

impl<'a> StepExecutionContext<'a> {
    pub fn new(
        step: &'a StepDefinition,
        config: serde_json::Map<String, serde_json::Value>,
        env: BTreeMap<String, String>,
        cancellation: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            step,
            config,
            env,
            cancellation,
            deadline,
            emitted: parking_lot::Mutex::new(BTreeMap::new()),
            resources: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn emit_outputs(&self, mapping: BTreeMap<String, String>) {
        self.emitted.lock().extend(mapping);
    }

    pub fn register_resource(
        &self,
        name: impl Into<String>,
        resource_type: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) {
        self.resources.lock().push(RegisteredResource {
            name: name.into(),
            resource_type: resource_type.into(),
            attributes,
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn into_emitted(self) -> (BTreeMap<String, String>, Vec<RegisteredResource>) {
        (self.emitted.into_inner(), self.resources.into_inner())
    }
}

/// A pluggable step handler with a uniform contract.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, ctx: &StepExecutionContext<'_>) -> Result<StepOutcome, StepFailure>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown step type: {0}")]
    UnknownStepType(String),
}

/// Registry of step executors, keyed by the step's `type` string.
pub struct StepExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl Default for StepExecutorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("validation", Arc::new(ValidationExecutor));
        registry.register("monitoring", Arc::new(MonitoringExecutor));
        registry
    }
}

impl StepExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type.into(), executor);
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    pub fn get(&self, step_type: &str) -> Result<Arc<dyn StepExecutor>, RegistryError> {
        self.executors
            .get(step_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStepType(step_type.to_string()))
    }
}

/// Built-in: no external side effect; may emit outputs it is configured with.
pub struct ValidationExecutor;

#[async_trait]
impl StepExecutor for ValidationExecutor {
    async fn execute(&self, ctx: &StepExecutionContext<'_>) -> Result<StepOutcome, StepFailure> {
        let mut outputs = BTreeMap::new();
        if let Some(preset) = ctx.config.get("outputs").and_then(|v| v.as_object()) {
            for (k, v) in preset {
                if let Some(s) = v.as_str() {
                    outputs.insert(k.clone(), s.to_string());
                }
            }
        }
        Ok(StepOutcome { outputs })
    }
}

/// Built-in: no-op telemetry.
pub struct MonitoringExecutor;

#[async_trait]
impl StepExecutor for MonitoringExecutor {
    async fn execute(&self, _ctx: &StepExecutionContext<'_>) -> Result<StepOutcome, StepFailure> {
        Ok(StepOutcome::default())
    }
}

/// Parses the contents of an `outputFile`: a JSON object, or `KEY=VALUE`
/// lines with blank lines and `#` comments ignored.
pub fn parse_output_file(contents: &str) -> BTreeMap<String, String> {
    let trimmed = contents.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            return map
                .into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                .collect();
        }
    }

    let mut out = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    out
}
