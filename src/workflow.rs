//! Workflow and step definitions: the immutable input to one execution.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::When;

/// A step's optional retry declaration: `retries: { max, backoff }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRetryPolicy {
    pub max: u32,
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
}

impl StepRetryPolicy {
    /// Exponential backoff seeded at `backoff`, bounded at 60 seconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let seconds = self.backoff.as_secs_f64() * 2f64.powi(retry_num as i32 - 1);
        Duration::from_secs_f64(seconds.min(60.0))
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Step definition, as authored in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, rename = "parallelGroup")]
    pub parallel_group: Option<u32>,
    #[serde(default)]
    pub when: When,
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub unless: Option<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, rename = "outputFile")]
    pub output_file: Option<String>,
    #[serde(default, rename = "setVariables")]
    pub set_variables: BTreeMap<String, String>,
    #[serde(default, rename = "timeoutSeconds")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retries: Option<StepRetryPolicy>,
}

/// Workflow definition: the input, immutable during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowDefinitionError {
    #[error("step '{0}' appears more than once")]
    DuplicateStep(String),
    #[error("step '{0}' depends on unknown step '{1}'")]
    UnknownDependency(String, String),
    #[error("cycle detected: {0}")]
    Cycle(String),
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validates step name uniqueness and that every `dependsOn` target
    /// exists. DAG cycle detection lives in the scheduler (it needs the
    /// full edge set, including implicit ordering edges).
    pub fn validate_shape(&self) -> Result<(), WorkflowDefinitionError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(WorkflowDefinitionError::DuplicateStep(step.name.clone()));
            }
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                if self.step(dep).is_none() {
                    return Err(WorkflowDefinitionError::UnknownDependency(
                        step.name.clone(),
                        dep.clone(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_minimal_workflow() {
        let json = serde_json::json!({
            "name": "deploy-app",
            "steps": [
                {"name": "A", "type": "validation"},
                {"name": "B", "type": "validation", "dependsOn": ["A"]}
            ]
        });
        let def: WorkflowDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].depends_on, vec!["A".to_string()]);
        assert!(def.validate_shape().is_ok());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let json = serde_json::json!({
            "name": "w",
            "steps": [{"name": "A", "type": "validation", "dependsOn": ["ghost"]}]
        });
        let def: WorkflowDefinition = serde_json::from_value(json).unwrap();
        assert!(matches!(
            def.validate_shape(),
            Err(WorkflowDefinitionError::UnknownDependency(_, _))
        ));
    }

    #[test]
    fn rejects_duplicate_step_name() {
        let json = serde_json::json!({
            "name": "w",
            "steps": [
                {"name": "A", "type": "validation"},
                {"name": "A", "type": "monitoring"}
            ]
        });
        let def: WorkflowDefinition = serde_json::from_value(json).unwrap();
        assert!(matches!(
            def.validate_shape(),
            Err(WorkflowDefinitionError::DuplicateStep(_))
        ));
    }

    #[test]
    fn retry_delay_doubles_and_caps_at_60s() {
        let policy = StepRetryPolicy {
            max: 5,
            backoff: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(40));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
    }
}
