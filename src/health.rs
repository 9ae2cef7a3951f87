//! Health and statistics surface: a read-only aggregate over the queue,
//! graph tracker, and store, meant for a liveness/readiness endpoint.

use std::sync::Arc;

use serde::Serialize;

use crate::graph::GraphTracker;
use crate::queue::{QueueStats, TaskQueue};
use crate::store::{OrchestratorStore, TaskState};

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub running: u64,
    pub succeeded_last_24h: u64,
    pub failed_last_24h: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub queue: QueueStatsView,
    pub executions: ExecutionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsView {
    pub queued: u64,
    pub running: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub workers: u64,
    pub capacity: u64,
}

impl From<QueueStats> for QueueStatsView {
    fn from(s: QueueStats) -> Self {
        Self {
            queued: s.queued,
            running: s.running,
            completed_total: s.completed_total,
            failed_total: s.failed_total,
            workers: s.workers,
            capacity: s.capacity,
        }
    }
}

/// Aggregates stats across the queue and store for a single application.
/// Graph stats are per-application and obtained directly from the
/// `GraphTracker`; they are not folded in here since callers typically
/// request them alongside a specific graph snapshot.
pub struct HealthReporter {
    queue: Arc<TaskQueue>,
    store: Arc<dyn OrchestratorStore>,
}

impl HealthReporter {
    pub fn new(queue: Arc<TaskQueue>, store: Arc<dyn OrchestratorStore>) -> Self {
        Self { queue, store }
    }

    pub async fn stats(&self, application_name: &str) -> EngineStats {
        let now = chrono::Utc::now();
        let window_start = now - chrono::Duration::hours(24);

        let tasks = self.store.list_tasks(application_name).await.unwrap_or_default();
        let running = tasks.iter().filter(|t| t.state == TaskState::Running).count() as u64;
        let succeeded = tasks
            .iter()
            .filter(|t| {
                t.state == TaskState::Completed
                    && t.completed_at.map(|c| c >= window_start).unwrap_or(false)
            })
            .count() as u64;
        let failed = tasks
            .iter()
            .filter(|t| {
                t.state == TaskState::Failed && t.completed_at.map(|c| c >= window_start).unwrap_or(false)
            })
            .count() as u64;

        EngineStats {
            queue: self.queue.stats().into(),
            executions: ExecutionStats {
                running,
                succeeded_last_24h: succeeded,
                failed_last_24h: failed,
            },
        }
    }

    pub fn graph_stats(&self, graph: &GraphTracker, application_name: &str) -> Option<crate::graph::GraphStats> {
        graph.graph_stats(application_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::store::InMemoryOrchestratorStore;

    #[tokio::test]
    async fn reports_zeroed_stats_for_unknown_application() {
        let store = Arc::new(InMemoryOrchestratorStore::new());
        let queue = TaskQueue::start(QueueConfig::default(), store.clone());
        let reporter = HealthReporter::new(queue, store);
        let stats = reporter.stats("ghost-app").await;
        assert_eq!(stats.executions.running, 0);
        assert_eq!(stats.queue.queued, 0);
    }
}
