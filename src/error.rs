use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::Id;
use crate::resolver::TypeAlias;

/// Error type for the engine and its protocol layers.
///
/// Variants fall into four groups, which callers are expected to treat
/// differently:
///
/// - **Protocol errors** (`InvalidId`, `UnknownTypeAlias`, `UnregisteredType`,
///   `DuplicateType`, `FrameShape`, `FrameCorrupted`, `ResultTypeMismatch`,
///   `NotResumable`, `Surrogate`) - surfaced immediately and never retried.
/// - **Late triggers** (`StepConsumed`) - the step was already resumed. Pollers
///   and webhooks can safely ignore these; see [`FlowError::is_consumed`].
/// - **Collaborator errors** (`Store`, `Host`, `Callback`) - failures of the
///   stores, the host or a suspension callback, propagated unchanged. Retrying
///   is up to the collaborator.
/// - `FrameNotFound` - no frame and no record of it ever being consumed,
///   which points at a wrong id or a damaged store.
///
/// Failures of user computations are *not* `FlowError`s: they become the
/// `Faulted` outcome of the flow and are handed to [`FlowHost::failed`](crate::FlowHost::failed).
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid id `{input}`: {reason}")]
    InvalidId { input: String, reason: String },

    #[error("unknown type alias `{type_id}`")]
    UnknownTypeAlias { type_id: TypeAlias },

    #[error("type `{type_name}` is not registered with the type resolver")]
    UnregisteredType { type_name: String },

    #[error("duplicate type registration: {reason}")]
    DuplicateType { reason: String },

    #[error("frame of type `{type_id}` has an unexpected shape: {reason}")]
    FrameShape { type_id: TypeAlias, reason: String },

    #[error("frame for step {step_id} failed its integrity check")]
    FrameCorrupted { step_id: Id },

    #[error("step {step_id} expects a result of type `{expected}`, got `{actual}`")]
    ResultTypeMismatch {
        step_id: Id,
        expected: TypeAlias,
        actual: TypeAlias,
    },

    #[error("step {step_id} cannot be resumed externally: {reason}")]
    NotResumable { step_id: Id, reason: String },

    #[error(transparent)]
    Surrogate(#[from] SurrogateError),

    #[error("step {step_id} was already consumed by an earlier resume")]
    StepConsumed { step_id: Id },

    #[error("no frame stored for step {step_id}")]
    FrameNotFound { step_id: Id },

    #[error("store operation `{operation}` failed: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("host hook `{hook}` failed for flow {flow_id}: {source}")]
    Host {
        hook: &'static str,
        flow_id: Id,
        #[source]
        source: anyhow::Error,
    },

    #[error("suspension callback failed for step {step_id}: {source}")]
    Callback {
        step_id: Id,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid flow state transition for {flow_id}: {from} -> {to}")]
    InvalidTransition {
        flow_id: Id,
        from: &'static str,
        to: &'static str,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// True for the distinct "already consumed" error a duplicate or late
    /// trigger produces.
    pub fn is_consumed(&self) -> bool {
        matches!(self, FlowError::StepConsumed { .. })
    }

    /// True for errors raised by stores, hosts or suspension callbacks.
    pub fn is_collaborator(&self) -> bool {
        matches!(
            self,
            FlowError::Store { .. } | FlowError::Host { .. } | FlowError::Callback { .. }
        )
    }

    pub(crate) fn store(operation: &'static str, source: anyhow::Error) -> Self {
        FlowError::Store { operation, source }
    }

    pub(crate) fn shape(type_id: &TypeAlias, reason: impl Into<String>) -> Self {
        FlowError::FrameShape {
            type_id: type_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for engine operations.
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors raised while converting values to and from surrogate tokens.
#[derive(Debug, Error)]
pub enum SurrogateError {
    #[error("no surrogator claims tokens of type `{type_id}`")]
    Unclaimed { type_id: TypeAlias },

    #[error("value of type `{type_name}` has no surrogator and cannot be stored")]
    NotSurrogatable { type_name: &'static str },

    #[error("malformed `{type_id}` token: {reason}")]
    Shape { type_id: TypeAlias, reason: String },

    #[error("restored `{type_id}` is not a `{expected}`")]
    Downcast {
        type_id: TypeAlias,
        expected: &'static str,
    },

    #[error("token was captured in scope `{captured}` but restored in scope `{current}`")]
    ScopeMismatch { captured: String, current: String },

    #[error("scope `{scope}` does not provide service `{type_id}`")]
    MissingService { scope: String, type_id: TypeAlias },

    #[error("child {step_id} belongs to flow {owner}, not {current}")]
    ForeignChild { step_id: Id, owner: Id, current: Id },

    #[error("array of `{type_id}` declared {expected} items, got {actual}")]
    ArrayLength {
        type_id: TypeAlias,
        expected: usize,
        actual: usize,
    },
}

/// Error type for user computations.
///
/// A [`Continuation`](crate::Continuation) returns `Err(TaskError)` to end in a
/// terminal state other than success. The engine never treats these as its own
/// failures: they are captured as the computation's outcome.
///
/// - `Failed(_)` - the computation faulted; the error is carried upward and,
///   if nothing handles it, handed to the host's fail hook.
/// - `Cancelled` - the computation observed a cancellation and stopped.
#[derive(Debug, Error)]
pub enum TaskError {
    /// An error occurred during the computation.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// The computation was cancelled.
    #[error("task was cancelled")]
    Cancelled,
}

/// Result type alias for user computations.
pub type TaskResult<T> = Result<T, TaskError>;

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Failed(err.into())
    }
}

impl From<FlowError> for TaskError {
    fn from(err: FlowError) -> Self {
        TaskError::Failed(err.into())
    }
}

impl From<TaskFailure> for TaskError {
    fn from(failure: TaskFailure) -> Self {
        TaskError::Failed(anyhow::Error::new(failure))
    }
}

/// Serializable description of a fault, as stored in frames and handed to
/// [`FlowHost::failed`](crate::FlowHost::failed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct TaskFailure {
    /// Error kind (e.g. `"Error"`, `"Panic"`, `"Aggregate"`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Inner failures of an aggregate (e.g. the faulted children of `when_all`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<TaskFailure>,
}

impl TaskFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Capture an `anyhow` error, including its chain of causes in the message.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(failure) = err.downcast_ref::<TaskFailure>() {
            return failure.clone();
        }
        Self::new("Error", format!("{err:#}"))
    }

    /// Capture a panic payload.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "computation panicked".to_string()
        };
        Self::new("Panic", message)
    }

    /// Combine the faults of several children.
    pub fn aggregate(causes: Vec<TaskFailure>, total: usize) -> Self {
        Self {
            name: "Aggregate".to_string(),
            message: format!("{} of {} tasks faulted", causes.len(), total),
            causes,
        }
    }
}
