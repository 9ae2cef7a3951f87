//! Variable/context store: the single source of truth for interpolation
//! inputs during one execution.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A tagged value used as the interpolation target, replacing runtime
/// type introspection over `serde_json::Value` with pattern matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(ScalarValue),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(ScalarValue::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(ScalarValue::String(s))
    }
}

impl Value {
    /// Build a `Value` tree from a `serde_json::Value`, for boundary use
    /// (step config, Score spec `params`).
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::String(s) => Value::Scalar(ScalarValue::String(s.clone())),
            serde_json::Value::Number(n) => {
                Value::Scalar(ScalarValue::Number(n.as_f64().unwrap_or(0.0)))
            }
            serde_json::Value::Bool(b) => Value::Scalar(ScalarValue::Bool(*b)),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
            serde_json::Value::Null => Value::Scalar(ScalarValue::String(String::new())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Scalar(ScalarValue::String(s)) => serde_json::Value::String(s.clone()),
            Value::Scalar(ScalarValue::Number(n)) => serde_json::json!(n),
            Value::Scalar(ScalarValue::Bool(b)) => serde_json::Value::Bool(*b),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::Scalar(ScalarValue::String(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Monotonic transition check per the distilled spec's context invariant.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Skipped)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("step '{0}' has no recorded outputs")]
    NoStepOutputs(String),
}

#[derive(Debug, Default)]
struct ContextInner {
    variables: BTreeMap<String, String>,
    step_outputs: BTreeMap<String, BTreeMap<String, String>>,
    resource_outputs: BTreeMap<String, BTreeMap<String, String>>,
    step_status: BTreeMap<String, StepStatus>,
    env_overrides: BTreeMap<String, String>,
}

/// Per-execution mutable store of variables and outputs.
///
/// Guarded by a single `parking_lot::Mutex` per the distilled spec's
/// "single mutation lock per execution" resource policy: writes are short
/// and never perform I/O while holding the lock.
#[derive(Debug, Default)]
pub struct Context {
    inner: Mutex<ContextInner>,
}

impl Context {
    pub fn new(variables: BTreeMap<String, String>) -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                variables,
                ..Default::default()
            }),
        }
    }

    /// Idempotent assignment into workflow-scope variables.
    pub fn set_workflow_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().variables.insert(key.into(), value.into());
    }

    /// Bulk write; replaces any prior entry for this step.
    pub fn set_step_outputs(&self, step_name: &str, mapping: BTreeMap<String, String>) {
        self.inner
            .lock()
            .step_outputs
            .insert(step_name.to_string(), mapping);
    }

    /// Merges into the prior entry for this resource.
    pub fn set_resource_outputs(&self, resource_name: &str, mapping: BTreeMap<String, String>) {
        let mut inner = self.inner.lock();
        inner
            .resource_outputs
            .entry(resource_name.to_string())
            .or_default()
            .extend(mapping);
    }

    pub fn set_step_status(&self, step_name: &str, status: StepStatus) {
        self.inner
            .lock()
            .step_status
            .insert(step_name.to_string(), status);
    }

    pub fn step_status(&self, step_name: &str) -> Option<StepStatus> {
        self.inner.lock().step_status.get(step_name).copied()
    }

    pub fn any_step_failed(&self) -> bool {
        self.inner
            .lock()
            .step_status
            .values()
            .any(|s| *s == StepStatus::Failed)
    }

    pub fn step_output(&self, step_name: &str, key: &str) -> Option<String> {
        self.inner
            .lock()
            .step_outputs
            .get(step_name)
            .and_then(|m| m.get(key))
            .cloned()
    }

    pub fn variable(&self, key: &str) -> Option<String> {
        self.inner.lock().variables.get(key).cloned()
    }

    /// Set the env overrides valid only while a step runs.
    pub fn set_env_overrides(&self, env: BTreeMap<String, String>) {
        self.inner.lock().env_overrides = env;
    }

    pub fn clear_env_overrides(&self) {
        self.inner.lock().env_overrides.clear();
    }

    /// Replaces all references of the forms `${workflow.KEY}`,
    /// `${stepName.outputKey}`, `${resources.name.attr}`, `$NAME`, `${NAME}`.
    pub fn interpolate(&self, s: &str) -> String {
        let inner = self.inner.lock();
        interpolate_str(s, &inner)
    }

    /// Recursive walk: interpolate strings in maps/lists/scalars; numbers
    /// and booleans pass through unchanged.
    pub fn interpolate_any(&self, v: &Value) -> Value {
        let inner = self.inner.lock();
        interpolate_value(v, &inner)
    }

    /// Returns the final string->string mapping for executor launch:
    /// step env > workflow variables > inherited process environment.
    pub fn build_step_environment(&self, step_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let inner = self.inner.lock();
        let mut merged: BTreeMap<String, String> = std::env::vars().collect();
        for (k, v) in &inner.variables {
            merged.insert(k.clone(), v.clone());
        }
        for (k, v) in step_env {
            merged.insert(k.clone(), interpolate_str(v, &inner));
        }
        merged
    }
}

fn interpolate_value(v: &Value, inner: &ContextInner) -> Value {
    match v {
        Value::Scalar(ScalarValue::String(s)) => {
            Value::Scalar(ScalarValue::String(interpolate_str(s, inner)))
        }
        Value::Scalar(other) => Value::Scalar(other.clone()),
        Value::List(items) => Value::List(items.iter().map(|i| interpolate_value(i, inner)).collect()),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, inner)))
                .collect(),
        ),
    }
}

/// Matches `${...}` and bare `$NAME` references.
fn interpolate_str(s: &str, inner: &ContextInner) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut literal_start = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = s[i + 2..].find('}') {
                let reference = &s[i + 2..i + 2 + end];
                out.push_str(&s[literal_start..i]);
                out.push_str(&resolve_reference(reference, inner));
                i += 2 + end + 1;
                literal_start = i;
                continue;
            }
        } else if bytes[i] == b'$' && i + 1 < bytes.len() && is_ident_start(bytes[i + 1]) {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && is_ident_char(bytes[end]) {
                end += 1;
            }
            let name = &s[start..end];
            out.push_str(&s[literal_start..i]);
            out.push_str(&resolve_reference(name, inner));
            i = end;
            literal_start = i;
            continue;
        }
        i += 1;
    }
    out.push_str(&s[literal_start..]);
    out
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn resolve_reference(reference: &str, inner: &ContextInner) -> String {
    let mut parts = reference.splitn(2, '.');
    let head = parts.next().unwrap_or("");
    let rest = parts.next();

    let resolved = match (head, rest) {
        ("workflow", Some(key)) => inner.variables.get(key).cloned(),
        ("resources", Some(rest)) => {
            let mut sub = rest.splitn(2, '.');
            let name = sub.next().unwrap_or("");
            let attr = sub.next().unwrap_or("");
            inner
                .resource_outputs
                .get(name)
                .and_then(|m| m.get(attr))
                .cloned()
        }
        (step_name, Some(output_key)) => inner
            .step_outputs
            .get(step_name)
            .and_then(|m| m.get(output_key))
            .cloned(),
        (name, None) => inner
            .env_overrides
            .get(name)
            .or_else(|| inner.variables.get(name))
            .cloned()
            .or_else(|| std::env::var(name).ok()),
    };

    match resolved {
        Some(v) => v,
        None => {
            warn!(reference, "unresolved interpolation reference, leaving verbatim");
            format!("${{{reference}}}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(vars: &[(&str, &str)]) -> Context {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Context::new(vars)
    }

    #[test]
    fn interpolates_workflow_variable() {
        let ctx = ctx_with(&[("ENV", "prod")]);
        assert_eq!(ctx.interpolate("${workflow.ENV}"), "prod");
    }

    #[test]
    fn interpolates_step_output_reference() {
        let ctx = ctx_with(&[]);
        let mut outputs = BTreeMap::new();
        outputs.insert("version".to_string(), "2.1.0".to_string());
        ctx.set_step_outputs("build", outputs);
        assert_eq!(ctx.interpolate("${build.version}"), "2.1.0");
    }

    #[test]
    fn interpolates_combined_scenario_s7() {
        let ctx = ctx_with(&[("ENV", "prod")]);
        let mut outputs = BTreeMap::new();
        outputs.insert("version".to_string(), "2.1.0".to_string());
        ctx.set_step_outputs("build", outputs);
        let result = ctx.interpolate("${workflow.ENV}-${build.version}");
        assert_eq!(result, "prod-2.1.0");
    }

    #[test]
    fn unresolved_reference_left_verbatim() {
        let ctx = ctx_with(&[]);
        assert_eq!(ctx.interpolate("${workflow.MISSING}"), "${workflow.MISSING}");
    }

    #[test]
    fn interpolation_is_idempotent() {
        let ctx = ctx_with(&[("ENV", "prod")]);
        let once = ctx.interpolate("${workflow.ENV}");
        let twice = ctx.interpolate(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn short_form_precedence_step_env_wins() {
        let ctx = ctx_with(&[("NAME", "workflow-value")]);
        ctx.set_env_overrides(BTreeMap::from([("NAME".to_string(), "step-value".to_string())]));
        assert_eq!(ctx.interpolate("$NAME"), "step-value");
    }

    #[test]
    fn resource_outputs_merge_not_replace() {
        let ctx = ctx_with(&[]);
        ctx.set_resource_outputs("db", BTreeMap::from([("host".to_string(), "h1".to_string())]));
        ctx.set_resource_outputs("db", BTreeMap::from([("port".to_string(), "5432".to_string())]));
        assert_eq!(ctx.interpolate("${resources.db.host}"), "h1");
        assert_eq!(ctx.interpolate("${resources.db.port}"), "5432");
    }

    #[test]
    fn interpolate_any_recurses_and_passes_through_non_strings() {
        let ctx = ctx_with(&[("ENV", "prod")]);
        let v = Value::Map(BTreeMap::from([
            ("name".to_string(), Value::from("${workflow.ENV}")),
            ("count".to_string(), Value::Scalar(ScalarValue::Number(3.0))),
            ("enabled".to_string(), Value::Scalar(ScalarValue::Bool(true))),
        ]));
        let result = ctx.interpolate_any(&v);
        match result {
            Value::Map(m) => {
                assert_eq!(m.get("name").unwrap().as_string(), Some("prod"));
                assert_eq!(m.get("count").unwrap(), &Value::Scalar(ScalarValue::Number(3.0)));
            }
            _ => panic!("expected map"),
        }
    }

    #[test]
    fn monotonic_status_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Succeeded));
        assert!(!StepStatus::Succeeded.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Succeeded));
    }
}
