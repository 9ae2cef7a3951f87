//! Crate-level error type composing each subsystem's error, for call
//! sites that cross module boundaries (the queue invoking the
//! scheduler, the scheduler invoking the store).

use crate::condition::ConditionError;
use crate::context::ContextError;
use crate::graph::GraphError;
use crate::queue::QueueError;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;
use crate::workflow::WorkflowDefinitionError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Workflow(#[from] WorkflowDefinitionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Condition(#[from] ConditionError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}
