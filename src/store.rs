//! Workflow store: durable record of executions, step records, tasks,
//! and the graph tables, behind one trait so callers don't care whether
//! the backing store is in-memory or PostgreSQL.
//!
//! Adapted from the `WorkflowEventStore` trait/Postgres-pool idiom,
//! generalized from workflow-instance rows to this engine's execution,
//! step, task, and graph record shapes, and with a retrying decorator
//! wrapping the degrade-to-in-memory failure policy the distilled spec
//! calls for.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

use crate::graph::{Edge, Node};
use crate::scheduler::ExecutionRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("execution '{0}' not found")]
    ExecutionNotFound(Uuid),
    #[error("task '{0}' not found")]
    TaskNotFound(Uuid),
    #[error("database error: {0}")]
    Database(String),
}

/// Durable record of a queued or running task, independent of whether
/// it originated from a workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub application_name: String,
    pub workflow_name: String,
    pub state: TaskState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Durable persistence for the orchestrator's state. Implementations
/// must not block the caller indefinitely; a store that cannot reach
/// its backend should fail fast so the retrying decorator can degrade.
#[async_trait]
pub trait OrchestratorStore: Send + Sync {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError>;
    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError>;
    async fn list_executions(&self, application_name: &str) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError>;
    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError>;
    async fn list_tasks(&self, application_name: &str) -> Result<Vec<TaskRecord>, StoreError>;

    async fn save_graph_node(&self, application_name: &str, node: &Node) -> Result<(), StoreError>;
    async fn save_graph_edge(&self, application_name: &str, edge: &Edge) -> Result<(), StoreError>;
}

/// In-memory store: the default for tests and for a single-process
/// deployment with no durable backend configured.
#[derive(Default)]
pub struct InMemoryOrchestratorStore {
    executions: RwLock<BTreeMap<Uuid, ExecutionRecord>>,
    tasks: RwLock<BTreeMap<Uuid, TaskRecord>>,
    graph_nodes: RwLock<Vec<(String, Node)>>,
    graph_edges: RwLock<Vec<(String, Edge)>>,
}

impl InMemoryOrchestratorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrchestratorStore for InMemoryOrchestratorStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.executions.write().insert(record.execution_id, record.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn list_executions(&self, application_name: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .filter(|e| e.application_name == application_name)
            .cloned()
            .collect())
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.tasks.write().insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn list_tasks(&self, application_name: &str) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.application_name == application_name)
            .cloned()
            .collect())
    }

    async fn save_graph_node(&self, application_name: &str, node: &Node) -> Result<(), StoreError> {
        self.graph_nodes.write().push((application_name.to_string(), node.clone()));
        Ok(())
    }

    async fn save_graph_edge(&self, application_name: &str, edge: &Edge) -> Result<(), StoreError> {
        self.graph_edges.write().push((application_name.to_string(), edge.clone()));
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub mod postgres {
    use super::*;
    use sqlx::{PgPool, Row};

    /// PostgreSQL-backed store. Connection pool sizing and migrations
    /// are the caller's responsibility; this type only issues queries.
    #[derive(Clone)]
    pub struct PostgresOrchestratorStore {
        pool: PgPool,
    }

    impl PostgresOrchestratorStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl OrchestratorStore for PostgresOrchestratorStore {
        #[tracing::instrument(skip(self, record))]
        async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
            let steps_json = serde_json::to_value(&record.steps)
                .map_err(|e| StoreError::Database(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO orchestrator_executions
                    (id, application_name, workflow_name, state, started_at, completed_at, error, steps)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    state = EXCLUDED.state,
                    completed_at = EXCLUDED.completed_at,
                    error = EXCLUDED.error,
                    steps = EXCLUDED.steps
                "#,
            )
            .bind(record.execution_id)
            .bind(&record.application_name)
            .bind(&record.workflow_name)
            .bind(format!("{:?}", record.state))
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(&record.error)
            .bind(steps_json)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("failed to save execution: {}", e);
                StoreError::Database(e.to_string())
            })?;
            Ok(())
        }

        #[tracing::instrument(skip(self))]
        async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
            let row = sqlx::query(
                r#"SELECT id, application_name, workflow_name, state, started_at, completed_at, error, steps
                   FROM orchestrator_executions WHERE id = $1"#,
            )
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

            let steps_json: serde_json::Value = row.get("steps");
            Ok(ExecutionRecord {
                execution_id: row.get("id"),
                application_name: row.get("application_name"),
                workflow_name: row.get("workflow_name"),
                state: parse_execution_state(&row.get::<String, _>("state"))?,
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                error: row.get("error"),
                steps: serde_json::from_value(steps_json).map_err(|e| StoreError::Database(e.to_string()))?,
            })
        }

        async fn list_executions(&self, application_name: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
            let rows = sqlx::query(
                r#"SELECT id FROM orchestrator_executions WHERE application_name = $1"#,
            )
            .bind(application_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(self.get_execution(row.get("id")).await?);
            }
            Ok(out)
        }

        async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
            sqlx::query(
                r#"
                INSERT INTO orchestrator_tasks
                    (id, application_name, workflow_name, state, created_at, started_at, completed_at, error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE SET
                    state = EXCLUDED.state,
                    started_at = EXCLUDED.started_at,
                    completed_at = EXCLUDED.completed_at,
                    error = EXCLUDED.error
                "#,
            )
            .bind(task.task_id)
            .bind(&task.application_name)
            .bind(&task.workflow_name)
            .bind(format!("{:?}", task.state))
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(&task.error)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        }

        async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
            let row = sqlx::query(
                r#"SELECT id, application_name, workflow_name, state, created_at, started_at, completed_at, error
                   FROM orchestrator_tasks WHERE id = $1"#,
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(task_id))?;

            Ok(TaskRecord {
                task_id: row.get("id"),
                application_name: row.get("application_name"),
                workflow_name: row.get("workflow_name"),
                state: parse_task_state(&row.get::<String, _>("state"))?,
                created_at: row.get("created_at"),
                started_at: row.get("started_at"),
                completed_at: row.get("completed_at"),
                error: row.get("error"),
            })
        }

        async fn list_tasks(&self, application_name: &str) -> Result<Vec<TaskRecord>, StoreError> {
            let rows = sqlx::query(r#"SELECT id FROM orchestrator_tasks WHERE application_name = $1"#)
                .bind(application_name)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;

            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                out.push(self.get_task(row.get("id")).await?);
            }
            Ok(out)
        }

        async fn save_graph_node(&self, application_name: &str, node: &Node) -> Result<(), StoreError> {
            sqlx::query(
                r#"
                INSERT INTO orchestrator_graph_nodes (id, application_name, node_type, name, state, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id, application_name) DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&node.id)
            .bind(application_name)
            .bind(format!("{:?}", node.node_type))
            .bind(&node.name)
            .bind(format!("{:?}", node.state))
            .bind(node.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        }

        async fn save_graph_edge(&self, application_name: &str, edge: &Edge) -> Result<(), StoreError> {
            sqlx::query(
                r#"
                INSERT INTO orchestrator_graph_edges (id, application_name, from_node_id, to_node_id, edge_type)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id, application_name) DO NOTHING
                "#,
            )
            .bind(&edge.id)
            .bind(application_name)
            .bind(&edge.from_node_id)
            .bind(&edge.to_node_id)
            .bind(format!("{:?}", edge.edge_type))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
            Ok(())
        }
    }

    fn parse_execution_state(s: &str) -> Result<crate::scheduler::ExecutionState, StoreError> {
        use crate::scheduler::ExecutionState::*;
        Ok(match s {
            "Queued" => Queued,
            "Running" => Running,
            "Succeeded" => Succeeded,
            "Failed" => Failed,
            "Cancelled" => Cancelled,
            other => return Err(StoreError::Database(format!("unknown execution state: {other}"))),
        })
    }

    fn parse_task_state(s: &str) -> Result<TaskState, StoreError> {
        use TaskState::*;
        Ok(match s {
            "Pending" => Pending,
            "Running" => Running,
            "Completed" => Completed,
            "Failed" => Failed,
            "Cancelled" => Cancelled,
            other => return Err(StoreError::Database(format!("unknown task state: {other}"))),
        })
    }
}

/// Wraps any store with the failure policy the distilled spec calls
/// for: 3 retries on a linear backoff, then degrade to an in-memory
/// fallback and emit a single warning (not a warning per write).
pub struct RetryingStore {
    inner: Arc<dyn OrchestratorStore>,
    fallback: InMemoryOrchestratorStore,
    max_attempts: u32,
    backoff: Duration,
    degraded: std::sync::atomic::AtomicBool,
}

impl RetryingStore {
    pub fn new(inner: Arc<dyn OrchestratorStore>) -> Self {
        Self {
            inner,
            fallback: InMemoryOrchestratorStore::new(),
            max_attempts: 3,
            backoff: Duration::from_millis(200),
            degraded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(attempt, error = %e, "store operation failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(self.backoff * attempt).await;
                }
            }
        }
        if !self.degraded.swap(true, std::sync::atomic::Ordering::SeqCst) {
            error!("store unreachable after {} attempts, degrading to in-memory fallback", self.max_attempts);
        }
        Err(last_err.unwrap_or(StoreError::Database("unknown failure".to_string())))
    }
}

#[async_trait]
impl OrchestratorStore for RetryingStore {
    async fn save_execution(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        if self.with_retry(|| self.inner.save_execution(record)).await.is_err() {
            return self.fallback.save_execution(record).await;
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        match self.with_retry(|| self.inner.get_execution(execution_id)).await {
            Ok(v) => Ok(v),
            Err(_) => self.fallback.get_execution(execution_id).await,
        }
    }

    async fn list_executions(&self, application_name: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        match self.with_retry(|| self.inner.list_executions(application_name)).await {
            Ok(v) => Ok(v),
            Err(_) => self.fallback.list_executions(application_name).await,
        }
    }

    async fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        if self.with_retry(|| self.inner.save_task(task)).await.is_err() {
            return self.fallback.save_task(task).await;
        }
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
        match self.with_retry(|| self.inner.get_task(task_id)).await {
            Ok(v) => Ok(v),
            Err(_) => self.fallback.get_task(task_id).await,
        }
    }

    async fn list_tasks(&self, application_name: &str) -> Result<Vec<TaskRecord>, StoreError> {
        match self.with_retry(|| self.inner.list_tasks(application_name)).await {
            Ok(v) => Ok(v),
            Err(_) => self.fallback.list_tasks(application_name).await,
        }
    }

    async fn save_graph_node(&self, application_name: &str, node: &Node) -> Result<(), StoreError> {
        if self
            .with_retry(|| self.inner.save_graph_node(application_name, node))
            .await
            .is_err()
        {
            return self.fallback.save_graph_node(application_name, node).await;
        }
        Ok(())
    }

    async fn save_graph_edge(&self, application_name: &str, edge: &Edge) -> Result<(), StoreError> {
        if self
            .with_retry(|| self.inner.save_graph_edge(application_name, edge))
            .await
            .is_err()
        {
            return self.fallback.save_graph_edge(application_name, edge).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ExecutionState;

    fn sample_execution(app: &str) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: Uuid::now_v7(),
            application_name: app.to_string(),
            workflow_name: "deploy-app".to_string(),
            state: ExecutionState::Succeeded,
            started_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
            error: None,
            steps: vec![],
        }
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_execution() {
        let store = InMemoryOrchestratorStore::new();
        let record = sample_execution("app1");
        store.save_execution(&record).await.unwrap();
        let fetched = store.get_execution(record.execution_id).await.unwrap();
        assert_eq!(fetched.workflow_name, "deploy-app");
    }

    #[tokio::test]
    async fn missing_execution_is_not_found() {
        let store = InMemoryOrchestratorStore::new();
        let result = store.get_execution(Uuid::now_v7()).await;
        assert!(matches!(result, Err(StoreError::ExecutionNotFound(_))));
    }

    #[tokio::test]
    async fn list_executions_filters_by_application() {
        let store = InMemoryOrchestratorStore::new();
        store.save_execution(&sample_execution("app1")).await.unwrap();
        store.save_execution(&sample_execution("app2")).await.unwrap();
        let app1_only = store.list_executions("app1").await.unwrap();
        assert_eq!(app1_only.len(), 1);
    }

    struct AlwaysFails;
    #[async_trait]
    impl OrchestratorStore for AlwaysFails {
        async fn save_execution(&self, _record: &ExecutionRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("unreachable".to_string()))
        }
        async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
            Err(StoreError::ExecutionNotFound(execution_id))
        }
        async fn list_executions(&self, _application_name: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
            Err(StoreError::Database("unreachable".to_string()))
        }
        async fn save_task(&self, _task: &TaskRecord) -> Result<(), StoreError> {
            Err(StoreError::Database("unreachable".to_string()))
        }
        async fn get_task(&self, task_id: Uuid) -> Result<TaskRecord, StoreError> {
            Err(StoreError::TaskNotFound(task_id))
        }
        async fn list_tasks(&self, _application_name: &str) -> Result<Vec<TaskRecord>, StoreError> {
            Err(StoreError::Database("unreachable".to_string()))
        }
        async fn save_graph_node(&self, _application_name: &str, _node: &Node) -> Result<(), StoreError> {
            Err(StoreError::Database("unreachable".to_string()))
        }
        async fn save_graph_edge(&self, _application_name: &str, _edge: &Edge) -> Result<(), StoreError> {
            Err(StoreError::Database("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn retrying_store_degrades_to_fallback() {
        let retrying = RetryingStore::new(Arc::new(AlwaysFails));
        let record = sample_execution("app1");
        retrying.save_execution(&record).await.unwrap();
        let fetched = retrying.get_execution(record.execution_id).await.unwrap();
        assert_eq!(fetched.execution_id, record.execution_id);
    }
}
