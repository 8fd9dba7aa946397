use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::TaskFailure;
use crate::id::Id;

/// Status of a suspendable computation.
///
/// `Pending -> Running -> {Suspended | Succeeded | Faulted | Canceled}`, and
/// `Suspended -> Running` on resume. A computation never returns to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet stepped
    Pending,
    /// Being stepped by the engine
    Running,
    /// Waiting at a suspension point, persisted as a frame
    Suspended,
    Succeeded,
    Faulted,
    Canceled,
}

impl TaskStatus {
    /// Returns true if the computation has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Faulted | TaskStatus::Canceled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Suspended | Succeeded | Faulted | Canceled) => true,
            (Suspended, Running) => true,
            _ => false,
        }
    }
}

/// Status of a whole flow, as stored in its [`FlowRecord`].
///
/// `Starting -> Running <-> Suspended -> {Succeeded | Faulted | Canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Starting,
    Running,
    Suspended,
    Succeeded,
    Faulted,
    Canceled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Succeeded | FlowStatus::Faulted | FlowStatus::Canceled
        )
    }

    /// Whether a flow in this status may move to `next`.
    ///
    /// Re-entering the same non-terminal status is allowed.
    pub fn can_transition_to(self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        match (self, next) {
            (from, to) if from == to => !from.is_terminal(),
            (Starting, Running) => true,
            (Running, Suspended) | (Suspended, Running) => true,
            (Running, Succeeded | Faulted | Canceled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Starting => "starting",
            FlowStatus::Running => "running",
            FlowStatus::Suspended => "suspended",
            FlowStatus::Succeeded => "succeeded",
            FlowStatus::Faulted => "faulted",
            FlowStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a computation.
///
/// The type parameter is the computation's output type. Use `JsonValue` for
/// dynamic access or a concrete type for compile-time safety.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome<T = JsonValue> {
    Succeeded(T),
    Faulted(TaskFailure),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Succeeded(_) => TaskStatus::Succeeded,
            Outcome::Faulted(_) => TaskStatus::Faulted,
            Outcome::Canceled => TaskStatus::Canceled,
        }
    }

    pub fn flow_status(&self) -> FlowStatus {
        match self {
            Outcome::Succeeded(_) => FlowStatus::Succeeded,
            Outcome::Faulted(_) => FlowStatus::Faulted,
            Outcome::Canceled => FlowStatus::Canceled,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    pub fn succeeded(self) -> Option<T> {
        match self {
            Outcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Outcome::Faulted(failure) => Some(failure),
            _ => None,
        }
    }
}

impl Outcome<JsonValue> {
    /// Convert to a typed outcome by deserializing the value.
    pub fn try_into_typed<T: DeserializeOwned>(self) -> Result<Outcome<T>, serde_json::Error> {
        Ok(match self {
            Outcome::Succeeded(value) => Outcome::Succeeded(serde_json::from_value(value)?),
            Outcome::Faulted(failure) => Outcome::Faulted(failure),
            Outcome::Canceled => Outcome::Canceled,
        })
    }
}

/// Untyped outcome passed between frames.
pub(crate) type Completion = Outcome<JsonValue>;

/// Result of [`when_any`](crate::when_any): which child finished first, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finished<T> {
    pub index: usize,
    pub outcome: Outcome<T>,
}

/// Durable status record of one flow, stored in the heap store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: Id,
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Terminal outcome, once the flow finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome<JsonValue>>,
    /// W3C trace context of the span that started the flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<HashMap<String, String>>,
}

impl FlowRecord {
    pub(crate) fn new(flow_id: Id) -> Self {
        let now = Utc::now();
        Self {
            flow_id,
            status: FlowStatus::Starting,
            created_at: now,
            updated_at: now,
            outcome: None,
            trace_context: None,
        }
    }
}

/// What a call to [`FlowEngine::start`](crate::FlowEngine::start) or
/// [`FlowEngine::resume`](crate::FlowEngine::resume) led to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The flow suspended; `pending` lists the step ids created by this call.
    Suspended { flow_id: Id, pending: Vec<Id> },
    /// An aggregator absorbed the result and keeps waiting for other children.
    Waiting { flow_id: Id },
    /// The flow reached a terminal state.
    Completed {
        flow_id: Id,
        outcome: Outcome<JsonValue>,
    },
    /// The result arrived for a parent that already completed (e.g. a losing
    /// `when_any` child) and had no further effect.
    Detached { flow_id: Id },
}

impl ResumeOutcome {
    pub fn flow_id(&self) -> Id {
        match self {
            ResumeOutcome::Suspended { flow_id, .. }
            | ResumeOutcome::Waiting { flow_id }
            | ResumeOutcome::Completed { flow_id, .. }
            | ResumeOutcome::Detached { flow_id } => *flow_id,
        }
    }

    /// Step ids created by this call (empty unless suspended).
    pub fn pending(&self) -> &[Id] {
        match self {
            ResumeOutcome::Suspended { pending, .. } => pending,
            _ => &[],
        }
    }

    pub fn outcome(&self) -> Option<&Outcome<JsonValue>> {
        match self {
            ResumeOutcome::Completed { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// A due-time entry registered by `delay` and `yield_now` suspensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub flow_id: Id,
    pub step_id: Id,
    pub due: DateTime<Utc>,
}

impl Reminder {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due <= now
    }
}

/// Options for configuring a [`ReminderWorker`](crate::ReminderWorker).
///
/// # Example
///
/// ```
/// use hibernate::ReminderOptions;
///
/// let options = ReminderOptions {
///     concurrency: 4,
///     poll_interval: 0.5,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ReminderOptions {
    /// Unique worker identifier (default: hostname:pid)
    pub worker_id: Option<String>,

    /// Seconds between scans of the reminder entries (default: 1.0)
    pub poll_interval: f64,

    /// Maximum parallel resumes (default: 1)
    pub concurrency: usize,

    /// Maximum reminders fired per scan (default: same as concurrency)
    pub batch_size: Option<usize>,
}

impl Default for ReminderOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: 1.0,
            concurrency: 1,
            batch_size: None,
        }
    }
}

impl ReminderOptions {
    /// Defaults overridden by `HIBERNATE_REMINDER_INTERVAL_MS` and
    /// `HIBERNATE_WORKER_ID` when set.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(ms) = std::env::var("HIBERNATE_REMINDER_INTERVAL_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            options.poll_interval = Duration::from_millis(ms).as_secs_f64();
        }
        if let Ok(worker_id) = std::env::var("HIBERNATE_WORKER_ID")
            && !worker_id.trim().is_empty()
        {
            options.worker_id = Some(worker_id);
        }
        options
    }
}
