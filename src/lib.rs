//! # innominatus-engine
//!
//! The orchestration core behind a platform orchestrator: a workflow
//! execution engine, a dependency graph tracker, and an asynchronous
//! task queue, tightly coupled the way the distilled architecture
//! requires.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          TaskQueue                            │
//! │  (bounded ingress, worker pool, graceful shutdown)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Scheduler                             │
//! │  (DAG build, condition eval, step dispatch, retries)         │
//! └──────────────┬───────────────────────────┬───────────────────┘
//!                ▼                           ▼
//! ┌───────────────────────────┐   ┌───────────────────────────────┐
//! │   Context / Registry       │   │        GraphTracker            │
//! │  (interpolation, executors) │   │  (nodes, edges, observers)    │
//! └───────────────────────────┘   └───────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    OrchestratorStore                         │
//! │  (executions, tasks, graph rows; degrades to in-memory)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod condition;
pub mod context;
pub mod error;
pub mod graph;
pub mod health;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod workflow;

/// Common imports for embedding the engine in a host process.
pub mod prelude {
    pub use crate::condition::{ConditionError, When};
    pub use crate::context::{Context, ContextError, StepStatus, Value};
    pub use crate::error::EngineError;
    pub use crate::graph::{
        Edge, EdgeType, ExportFormat, GraphError, GraphEvent, GraphSnapshot, GraphStats, GraphTracker, Node,
        NodeState, NodeType, ObserverHandle,
    };
    pub use crate::health::{EngineStats, ExecutionStats, HealthReporter};
    pub use crate::queue::{BoxedWork, QueueConfig, QueueError, QueueStats, TaskQueue};
    pub use crate::registry::{
        RegisteredResource, RegistryError, StepExecutionContext, StepExecutor, StepExecutorRegistry,
        StepFailure, StepOutcome,
    };
    pub use crate::scheduler::{ExecutionRecord, ExecutionState, Scheduler, SchedulerConfig, SchedulerError};
    pub use crate::store::{OrchestratorStore, StoreError, TaskRecord, TaskState};
    pub use crate::workflow::{StepDefinition, StepRetryPolicy, WorkflowDefinition, WorkflowDefinitionError};
}

pub use error::EngineError;
pub use scheduler::{ExecutionRecord, ExecutionState, Scheduler, SchedulerConfig};
pub use store::OrchestratorStore;
pub use workflow::WorkflowDefinition;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use queue::{QueueConfig, QueueError, TaskQueue};
use registry::StepExecutorRegistry;
use store::InMemoryOrchestratorStore;

/// Top-level facade wiring the queue, scheduler, graph tracker, and
/// store together, mirroring the composition the overview describes:
/// a submitter calls the queue, which persists a task record and
/// dispatches into the scheduler, which drives the graph and writes
/// the execution back to the store.
pub struct Engine {
    queue: Arc<TaskQueue>,
    scheduler: Arc<scheduler::Scheduler>,
    graph: Arc<graph::GraphTracker>,
    store: Arc<dyn OrchestratorStore>,
}

impl Engine {
    pub fn new(registry: StepExecutorRegistry, queue_config: QueueConfig, scheduler_config: SchedulerConfig) -> Self {
        let store: Arc<dyn OrchestratorStore> = Arc::new(InMemoryOrchestratorStore::new());
        let graph = Arc::new(graph::GraphTracker::in_memory());
        let scheduler = Arc::new(scheduler::Scheduler::new(Arc::new(registry), graph.clone(), scheduler_config));
        let queue = TaskQueue::start(queue_config, store.clone());
        Self { queue, scheduler, graph, store }
    }

    pub fn with_store(mut self, store: Arc<dyn OrchestratorStore>) -> Self {
        self.store = store;
        self
    }

    /// Submits a workflow for execution; returns immediately with a
    /// task identifier while the run happens on the queue's worker.
    pub async fn submit(
        &self,
        application_name: impl Into<String>,
        workflow: WorkflowDefinition,
    ) -> Result<Uuid, QueueError> {
        let application_name = application_name.into();
        self.scheduler
            .validate(&workflow)
            .map_err(|e| QueueError::InputError(e.to_string()))?;

        let scheduler = self.scheduler.clone();
        let store = self.store.clone();
        let app_for_work = application_name.clone();

        self.queue
            .submit(
                application_name,
                workflow.name.clone(),
                Box::new(move |cancellation: CancellationToken| {
                    Box::pin(async move {
                        let record = scheduler
                            .run(&app_for_work, &workflow, cancellation)
                            .await
                            .map_err(|e| e.to_string())?;
                        store.save_execution(&record).await.map_err(|e| e.to_string())?;
                        if record.state == ExecutionState::Failed {
                            return Err(record.error.unwrap_or_else(|| "workflow failed".to_string()));
                        }
                        Ok(())
                    }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>>
                }),
            )
            .await
    }

    pub fn graph(&self) -> &graph::GraphTracker {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn OrchestratorStore> {
        &self.store
    }

    pub async fn shutdown(&self) {
        let _ = self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn engine_submits_and_executes_sequential_workflow() {
        let engine = Engine::new(
            StepExecutorRegistry::default(),
            QueueConfig::default(),
            SchedulerConfig::default(),
        );

        let workflow = WorkflowDefinition {
            name: "deploy-app".to_string(),
            description: String::new(),
            variables: BTreeMap::new(),
            steps: vec![
                workflow::StepDefinition {
                    name: "A".to_string(),
                    step_type: "validation".to_string(),
                    config: Default::default(),
                    env: Default::default(),
                    depends_on: vec![],
                    parallel: false,
                    parallel_group: None,
                    when: Default::default(),
                    if_expr: None,
                    unless: None,
                    outputs: vec![],
                    output_file: None,
                    set_variables: Default::default(),
                    timeout_seconds: None,
                    retries: None,
                },
            ],
        };

        engine.submit("app1", workflow).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let executions = engine.store().list_executions("app1").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].state, ExecutionState::Succeeded);

        engine.shutdown().await;
    }
}
