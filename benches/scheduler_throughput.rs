//! Scheduler throughput benchmark: many parallel workflows, each with
//! several sequential steps, run concurrently through the same
//! `Scheduler` instance.
//!
//! Grounded on the target scenario of the worker-pool throughput
//! benchmark (thousands of workflows, many steps each, measured as
//! workflows/sec and tasks/sec) but driven through `criterion`'s async
//! Tokio harness rather than the teacher's bespoke progress-bar-driven
//! bench runner, since `criterion` is the benchmarking crate already
//! declared for this workspace.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use innominatus_engine::graph::GraphTracker;
use innominatus_engine::registry::StepExecutorRegistry;
use innominatus_engine::scheduler::{Scheduler, SchedulerConfig};
use innominatus_engine::workflow::{StepDefinition, WorkflowDefinition};

fn sequential_workflow(name: &str, step_count: usize) -> WorkflowDefinition {
    let mut steps = Vec::with_capacity(step_count);
    for i in 0..step_count {
        steps.push(StepDefinition {
            name: format!("step-{i}"),
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
        });
    }
    WorkflowDefinition {
        name: name.to_string(),
        description: String::new(),
        variables: BTreeMap::new(),
        steps,
    }
}

fn bench_concurrent_workflows(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("scheduler_throughput");
    for workflow_count in [10usize, 100] {
        group.bench_function(format!("{workflow_count}wf_x10steps"), |b| {
            b.to_async(&rt).iter_batched(
                || {
                    let scheduler = Arc::new(Scheduler::new(
                        Arc::new(StepExecutorRegistry::default()),
                        Arc::new(GraphTracker::in_memory()),
                        SchedulerConfig::default(),
                    ));
                    let workflows: Vec<WorkflowDefinition> = (0..workflow_count)
                        .map(|i| sequential_workflow(&format!("wf-{i}"), 10))
                        .collect();
                    (scheduler, workflows)
                },
                |(scheduler, workflows)| async move {
                    let mut handles = Vec::with_capacity(workflows.len());
                    for (i, workflow) in workflows.into_iter().enumerate() {
                        let scheduler = scheduler.clone();
                        handles.push(tokio::spawn(async move {
                            scheduler
                                .run(&format!("app-{i}"), &workflow, CancellationToken::new())
                                .await
                                .unwrap()
                        }));
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_concurrent_workflows);
criterion_main!(benches);
