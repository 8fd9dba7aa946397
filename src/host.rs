use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::TaskFailure;
use crate::id::Id;

/// Lifecycle hooks of the system embedding the engine.
///
/// Every `start` or `resume` call is bracketed by [`initialize`](Self::initialize)
/// and [`finalize`](Self::finalize); in between, exactly the hooks matching the
/// transitions of that call fire. Host-scoped state (a pending HTTP response,
/// a request log) lives in the implementing type.
///
/// A hook returning `Err` aborts the engine call with `FlowError::Host`.
/// All hooks default to doing nothing.
///
/// `started` and the completion hooks run while the engine holds the flow's
/// lock and must not call back into the engine for the same flow.
///
/// # Example
///
/// ```ignore
/// struct Responder { replies: Mutex<HashMap<Id, JsonValue>> }
///
/// #[async_trait]
/// impl FlowHost for Responder {
///     async fn succeeded(&self, flow_id: Id, value: &JsonValue) -> anyhow::Result<()> {
///         self.replies.lock().await.insert(flow_id, value.clone());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait FlowHost: Send + Sync + 'static {
    async fn initialize(&self, _flow_id: Id) -> anyhow::Result<()> {
        Ok(())
    }

    /// A new flow was created.
    async fn started(&self, _flow_id: Id) -> anyhow::Result<()> {
        Ok(())
    }

    /// The flow suspended; `pending` are the step ids persisted by this call.
    /// Runs after the frames are persisted and before suspension callbacks.
    /// The callbacks still run if this hook fails, and the call then returns
    /// the hook's error.
    async fn suspended(&self, _flow_id: Id, _pending: &[Id]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn succeeded(&self, _flow_id: Id, _value: &JsonValue) -> anyhow::Result<()> {
        Ok(())
    }

    async fn failed(&self, _flow_id: Id, _failure: &TaskFailure) -> anyhow::Result<()> {
        Ok(())
    }

    async fn canceled(&self, _flow_id: Id) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs last, whether the call succeeded or not.
    async fn finalize(&self, _flow_id: Id) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A host that ignores every transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl FlowHost for NoopHost {}
