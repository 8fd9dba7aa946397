use hibernate::{
    FlowEngine, FlowStatus, Id, MemoryHeapStore, MemoryStackStore, ReminderOptions, ResumeOutcome,
};
use std::sync::Arc;
use std::time::Duration;

use super::flows::bench_config;

/// Context for running a single benchmark iteration.
/// Every context gets its own in-memory stores.
pub struct BenchContext {
    pub engine: FlowEngine,
    pub stack: Arc<MemoryStackStore>,
    pub heap: Arc<MemoryHeapStore>,
}

impl BenchContext {
    pub fn new() -> Self {
        let stack = Arc::new(MemoryStackStore::new());
        let heap = Arc::new(MemoryHeapStore::new());
        let engine = FlowEngine::builder()
            .config(bench_config())
            .stack_store(Arc::clone(&stack))
            .heap_store(Arc::clone(&heap))
            .build()
            .expect("Failed to build bench engine");
        Self {
            engine,
            stack,
            heap,
        }
    }

    /// A second engine over the same stores, as another process would see them.
    pub fn peer(&self) -> FlowEngine {
        FlowEngine::builder()
            .config(bench_config())
            .stack_store(Arc::clone(&self.stack))
            .heap_store(Arc::clone(&self.heap))
            .build()
            .expect("Failed to build bench engine")
    }
}

/// Resume a chain of single suspensions with `value` until the flow completes.
pub async fn drive_chain(engine: &FlowEngine, mut outcome: ResumeOutcome, value: u64) -> usize {
    let mut resumes = 0;
    while let ResumeOutcome::Suspended { pending, .. } = &outcome {
        outcome = engine.resume_with(pending[0], &value).await.unwrap();
        resumes += 1;
    }
    resumes
}

pub fn bench_reminder_options(concurrency: usize) -> ReminderOptions {
    ReminderOptions {
        poll_interval: 0.005,
        concurrency,
        ..Default::default()
    }
}

/// Poll until every flow reached a terminal status.
pub async fn wait_for_flows_complete(engine: &FlowEngine, flows: &[Id], timeout_secs: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    for flow_id in flows {
        loop {
            let status = engine.status(*flow_id).await.unwrap();
            if status.is_some_and(FlowStatus::is_terminal) {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("Timeout waiting for flow {flow_id}");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
