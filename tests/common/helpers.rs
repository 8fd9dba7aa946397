use hibernate::{
    FlowEngine, FlowHost, FlowStatus, Id, MemoryHeapStore, MemoryStackStore, ServiceScope,
    TaskFailure, async_trait,
};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::flows;

/// Engine over fresh in-memory stores with every test continuation registered.
pub fn create_engine() -> FlowEngine {
    FlowEngine::builder()
        .config(flows::config())
        .build()
        .expect("Failed to build engine")
}

/// Engine over the given stores, as a second process would see them.
pub fn engine_on(
    stack: &Arc<MemoryStackStore>,
    heap: &Arc<MemoryHeapStore>,
    services: ServiceScope,
) -> FlowEngine {
    FlowEngine::builder()
        .config(flows::config())
        .stack_store(Arc::clone(stack))
        .heap_store(Arc::clone(heap))
        .services(services)
        .build()
        .expect("Failed to build engine")
}

/// Poll the flow record until it reaches `expected` or `timeout` elapses.
pub async fn wait_for_status<H: FlowHost>(
    engine: &FlowEngine<H>,
    flow_id: Id,
    expected: FlowStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if engine.status(flow_id).await.unwrap() == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// RecordingHost - records every lifecycle hook
// ============================================================================

#[derive(Default)]
pub struct RecordingHost {
    events: Mutex<Vec<String>>,
    /// Hook that returns an error instead of recording.
    fail_on: Option<&'static str>,
}

impl RecordingHost {
    pub fn failing_on(hook: &'static str) -> Self {
        Self {
            events: Mutex::default(),
            fail_on: Some(hook),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn record(&self, hook: &'static str, event: String) -> anyhow::Result<()> {
        if self.fail_on == Some(hook) {
            anyhow::bail!("{hook} hook rejected the flow");
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl FlowHost for RecordingHost {
    async fn initialize(&self, _flow_id: Id) -> anyhow::Result<()> {
        self.record("initialize", "initialize".to_string())
    }

    async fn started(&self, _flow_id: Id) -> anyhow::Result<()> {
        self.record("started", "started".to_string())
    }

    async fn suspended(&self, _flow_id: Id, pending: &[Id]) -> anyhow::Result<()> {
        self.record("suspended", format!("suspended:{}", pending.len()))
    }

    async fn succeeded(&self, _flow_id: Id, value: &JsonValue) -> anyhow::Result<()> {
        self.record("succeeded", format!("succeeded:{value}"))
    }

    async fn failed(&self, _flow_id: Id, failure: &TaskFailure) -> anyhow::Result<()> {
        self.record("failed", format!("failed:{}", failure.name))
    }

    async fn canceled(&self, _flow_id: Id) -> anyhow::Result<()> {
        self.record("canceled", "canceled".to_string())
    }

    async fn finalize(&self, _flow_id: Id) -> anyhow::Result<()> {
        self.record("finalize", "finalize".to_string())
    }
}

/// Engine with a [`RecordingHost`].
pub fn create_engine_with_host(host: RecordingHost) -> FlowEngine<RecordingHost> {
    FlowEngine::builder()
        .config(flows::config())
        .host(host)
        .build()
        .expect("Failed to build engine")
}
