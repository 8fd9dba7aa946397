use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use std::any::{TypeId, type_name};
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::context::StepContext;
use crate::error::{FlowResult, TaskError, TaskFailure, TaskResult};
use crate::id::Id;
use crate::inspect::{FrameWriter, Inspect};
use crate::resolver::{TypeAlias, TypeResolver};
use crate::store::HeapStore;
use crate::types::{Completion, Finished, Outcome, TaskStatus};

/// A suspendable state machine.
///
/// Each call to [`resume`](Self::resume) runs the computation from its current
/// suspension point to the next one. The continuation keeps its position in an
/// awaiter field (see [`Inspect`]) and either awaits another task or finishes.
///
/// Between steps the engine may dehydrate the continuation into a frame and
/// hydrate it again in another process, so every field that matters for the
/// next step must be part of its [`Inspect`] layout.
///
/// # Example
///
/// ```ignore
/// struct Approval {
///     state: u32,
///     request: String,
/// }
///
/// hibernate::inspect! { Approval { awaiter state, user request } }
///
/// impl Continuation for Approval {
///     type Output = bool;
///
///     fn resume(&mut self, _cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<bool>> {
///         match self.state {
///             0 => {
///                 self.state = 1;
///                 Ok(Step::wait(Task::<bool>::suspend(notify_reviewer)))
///             }
///             _ => Ok(Step::Done(input.value()?)),
///         }
///     }
/// }
/// ```
pub trait Continuation: Send + 'static {
    /// Output type (must be JSON-serializable)
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Advance to the next suspension point.
    ///
    /// `input` is [`Resumption::Start`] on the first call and the outcome of
    /// the awaited task afterwards. Returning `Err` ends the computation as
    /// faulted or canceled; panics are caught and treated as faults.
    fn resume(
        &mut self,
        cx: &mut StepContext<'_>,
        input: Resumption,
    ) -> TaskResult<Step<Self::Output>>;
}

/// What a continuation does next.
pub enum Step<T> {
    /// Suspend until the task completes, then resume with its outcome.
    Await(Awaited),
    /// Finish with a value.
    Done(T),
}

impl<T> Step<T> {
    pub fn wait<U>(task: Task<U>) -> Self {
        Step::Await(task.into())
    }
}

/// A task of any output type, as awaited by a continuation.
pub struct Awaited(pub(crate) TaskNode);

impl<U> From<Task<U>> for Awaited {
    fn from(task: Task<U>) -> Self {
        Awaited(task.node)
    }
}

/// Input to a continuation step.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    /// First step; nothing was awaited yet.
    Start,
    /// The awaited task succeeded with this value.
    Value(JsonValue),
    /// The awaited task faulted.
    Failed(TaskFailure),
    /// The awaited task was canceled, or cancellation of the flow was requested.
    Canceled,
}

impl Resumption {
    pub fn is_start(&self) -> bool {
        matches!(self, Resumption::Start)
    }

    /// The awaited value, propagating faults and cancellation with `?`.
    pub fn value<T: DeserializeOwned>(self) -> TaskResult<T> {
        match self {
            Resumption::Value(value) => Ok(serde_json::from_value(value)?),
            Resumption::Failed(failure) => Err(failure.into()),
            Resumption::Canceled => Err(TaskError::Cancelled),
            Resumption::Start => Err(TaskError::Failed(anyhow::anyhow!(
                "continuation expected a value but was started"
            ))),
        }
    }

    /// The awaited outcome, for continuations that handle faults themselves.
    pub fn outcome<T: DeserializeOwned>(self) -> TaskResult<Outcome<T>> {
        let outcome = match self {
            Resumption::Value(value) => Outcome::Succeeded(value),
            Resumption::Failed(failure) => Outcome::Faulted(failure),
            Resumption::Canceled => Outcome::Canceled,
            Resumption::Start => {
                return Err(TaskError::Failed(anyhow::anyhow!(
                    "continuation expected an outcome but was started"
                )));
            }
        };
        Ok(outcome.try_into_typed()?)
    }
}

impl From<Completion> for Resumption {
    fn from(completion: Completion) -> Self {
        match completion {
            Outcome::Succeeded(value) => Resumption::Value(value),
            Outcome::Faulted(failure) => Resumption::Failed(failure),
            Outcome::Canceled => Resumption::Canceled,
        }
    }
}

/// External input delivered to a suspended step.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// A result value and the alias of its type.
    Value { type_id: TypeAlias, value: JsonValue },
    /// Resume the step as faulted.
    Failed(TaskFailure),
    /// Resume the step as canceled.
    Canceled,
}

impl Signal {
    /// A result of type `()`, used for timers and plain wake-ups.
    pub fn unit(resolver: &TypeResolver) -> FlowResult<Self> {
        Self::typed(resolver, &())
    }

    pub fn value(type_id: TypeAlias, value: JsonValue) -> Self {
        Signal::Value { type_id, value }
    }

    /// A result of type `T`, tagged with its registered alias.
    pub fn typed<T: Serialize + 'static>(resolver: &TypeResolver, value: &T) -> FlowResult<Self> {
        Ok(Signal::Value {
            type_id: resolver.type_id::<T>()?.clone(),
            value: serde_json::to_value(value)?,
        })
    }

    pub(crate) fn into_completion(self) -> Completion {
        match self {
            Signal::Value { value, .. } => Outcome::Succeeded(value),
            Signal::Failed(failure) => Outcome::Faulted(failure),
            Signal::Canceled => Outcome::Canceled,
        }
    }
}

/// Where a suspension landed, handed to its [`SuspendCallback`].
#[derive(Clone)]
pub struct SuspendPoint {
    pub flow_id: Id,
    /// Step id to resume with the result.
    pub step_id: Id,
    /// Side-channel store for callback addresses, tokens and the like.
    pub heap: Arc<dyn HeapStore>,
}

impl std::fmt::Debug for SuspendPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendPoint")
            .field("flow_id", &self.flow_id)
            .field("step_id", &self.step_id)
            .finish_non_exhaustive()
    }
}

/// Registers the trigger that will later resume a suspended step (a webhook,
/// a timer, a message subscription).
///
/// Called exactly once per suspension, and only after the frame is persisted
/// and retrievable by `point.step_id`. Implemented for async closures:
///
/// ```ignore
/// let task = Task::<String>::suspend(|point: SuspendPoint| async move {
///     webhooks.register(point.step_id).await
/// });
/// ```
#[async_trait]
pub trait SuspendCallback: Send + Sync {
    async fn on_suspended(&self, point: SuspendPoint) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> SuspendCallback for F
where
    F: Fn(SuspendPoint) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn on_suspended(&self, point: SuspendPoint) -> anyhow::Result<()> {
        (self)(point).await
    }
}

/// Identity of the result type a suspension expects.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExpectedType {
    rust_type: TypeId,
    type_name: &'static str,
}

impl ExpectedType {
    fn of<T: 'static>() -> Self {
        Self {
            rust_type: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    pub(crate) fn alias(self, resolver: &TypeResolver) -> FlowResult<TypeAlias> {
        Ok(resolver.alias_of(self.rust_type, self.type_name)?.clone())
    }
}

/// Suspension points that wait for something outside the flow.
pub(crate) enum Leaf {
    Suspend {
        expects: ExpectedType,
        callback: Arc<dyn SuspendCallback>,
    },
    Delay(Duration),
    Yield,
}

impl Leaf {
    pub(crate) fn expects(&self) -> ExpectedType {
        match self {
            Leaf::Suspend { expects, .. } => *expects,
            Leaf::Delay(_) | Leaf::Yield => ExpectedType::of::<()>(),
        }
    }
}

/// Untyped task tree.
pub(crate) enum TaskNode {
    Ready(Completion),
    Leaf(Leaf),
    All(Vec<TaskNode>),
    Any(Vec<TaskNode>),
    Continuation(Box<dyn ErasedContinuation>),
}

/// Object-safe view of a `Continuation + Inspect`.
pub(crate) trait ErasedContinuation: Send {
    fn rust_type(&self) -> (TypeId, &'static str);

    fn advance(&mut self, cx: &mut StepContext<'_>, input: Resumption) -> Advance;

    fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()>;
}

pub(crate) enum Advance {
    Await(TaskNode),
    Done(Completion),
}

impl<C> ErasedContinuation for C
where
    C: Continuation + Inspect,
{
    fn rust_type(&self) -> (TypeId, &'static str) {
        (TypeId::of::<C>(), type_name::<C>())
    }

    fn advance(&mut self, cx: &mut StepContext<'_>, input: Resumption) -> Advance {
        match catch_unwind(AssertUnwindSafe(|| self.resume(cx, input))) {
            Ok(Ok(Step::Await(Awaited(node)))) => Advance::Await(node),
            Ok(Ok(Step::Done(value))) => Advance::Done(succeeded(&value)),
            Ok(Err(TaskError::Failed(err))) => {
                Advance::Done(Outcome::Faulted(TaskFailure::from_error(&err)))
            }
            Ok(Err(TaskError::Cancelled)) => Advance::Done(Outcome::Canceled),
            Err(payload) => Advance::Done(Outcome::Faulted(TaskFailure::from_panic(&*payload))),
        }
    }

    fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()> {
        Inspect::dehydrate(self, w)
    }
}

fn succeeded<T: Serialize>(value: &T) -> Completion {
    match serde_json::to_value(value) {
        Ok(value) => Outcome::Succeeded(value),
        Err(err) => Outcome::Faulted(TaskFailure::new("Serialization", err.to_string())),
    }
}

/// A suspendable computation producing `T`.
///
/// Tasks are lazy descriptions: nothing runs until the task is started by a
/// [`FlowEngine`](crate::FlowEngine) or awaited by a running continuation.
pub struct Task<T> {
    pub(crate) node: TaskNode,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Task<T> {
    pub(crate) fn from_node(node: TaskNode) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// A task that already faulted.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::faulted(TaskFailure::from_error(&err.into()))
    }

    pub fn faulted(failure: TaskFailure) -> Self {
        Self::from_node(TaskNode::Ready(Outcome::Faulted(failure)))
    }

    /// A task that is already canceled.
    pub fn canceled() -> Self {
        Self::from_node(TaskNode::Ready(Outcome::Canceled))
    }

    /// Current status: terminal for ready tasks, `Pending` otherwise.
    pub fn status(&self) -> TaskStatus {
        match &self.node {
            TaskNode::Ready(outcome) => outcome.status(),
            _ => TaskStatus::Pending,
        }
    }
}

impl<T> Task<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// A task that already succeeded with `value`.
    pub fn completed(value: T) -> Self {
        Self::from_node(TaskNode::Ready(succeeded(&value)))
    }

    /// Suspend until an external trigger delivers a `T` (or a fault or
    /// cancellation) for the step this suspension is persisted at.
    ///
    /// `T` must be registered with the type resolver: resuming with a value
    /// of another registered type fails with `ResultTypeMismatch`.
    pub fn suspend(callback: impl SuspendCallback + 'static) -> Self {
        Self::from_node(TaskNode::Leaf(Leaf::Suspend {
            expects: ExpectedType::of::<T>(),
            callback: Arc::new(callback),
        }))
    }

    /// Run a continuation.
    pub fn from_continuation<C>(continuation: C) -> Self
    where
        C: Continuation<Output = T> + Inspect,
    {
        Self::from_node(TaskNode::Continuation(Box::new(continuation)))
    }
}

impl Task<()> {
    /// Suspend for `duration`. The wake-up is registered as a reminder entry
    /// in the heap store and delivered by a [`ReminderWorker`](crate::ReminderWorker).
    pub fn delay(duration: Duration) -> Self {
        Self::from_node(TaskNode::Leaf(Leaf::Delay(duration)))
    }

    /// Suspend and become due again immediately.
    pub fn yield_now() -> Self {
        Self::from_node(TaskNode::Leaf(Leaf::Yield))
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("output", &type_name::<T>())
            .field("status", &self.status())
            .finish()
    }
}

/// Complete once every task reached a terminal state.
///
/// Succeeds with all values in order. If any task faulted, the result is an
/// aggregate fault carrying each child fault; otherwise, if any task was
/// canceled, the result is canceled. An empty list succeeds immediately.
pub fn when_all<T>(tasks: impl IntoIterator<Item = Task<T>>) -> Task<Vec<T>> {
    Task::from_node(TaskNode::All(tasks.into_iter().map(|t| t.node).collect()))
}

/// Complete as soon as the first task reaches any terminal state.
///
/// The other tasks keep running; their later completions have no effect on
/// this task. An empty list faults immediately.
pub fn when_any<T>(tasks: impl IntoIterator<Item = Task<T>>) -> Task<Finished<T>> {
    Task::from_node(TaskNode::Any(tasks.into_iter().map(|t| t.node).collect()))
}

/// Combine the outcomes of all children of a `when_all`.
pub(crate) fn combine_all(outcomes: Vec<Completion>) -> Completion {
    let total = outcomes.len();
    let mut values = Vec::with_capacity(total);
    let mut faults = Vec::new();
    let mut canceled = false;
    for outcome in outcomes {
        match outcome {
            Outcome::Succeeded(value) => values.push(value),
            Outcome::Faulted(failure) => faults.push(failure),
            Outcome::Canceled => canceled = true,
        }
    }
    if !faults.is_empty() {
        Outcome::Faulted(TaskFailure::aggregate(faults, total))
    } else if canceled {
        Outcome::Canceled
    } else {
        Outcome::Succeeded(JsonValue::Array(values))
    }
}

/// The outcome of a `when_any` whose child at `index` finished first.
pub(crate) fn first_finished(index: usize, outcome: Completion) -> Completion {
    succeeded(&Finished { index, outcome })
}

/// Error for a `when_any` over no tasks.
pub(crate) fn empty_when_any() -> Completion {
    Outcome::Faulted(TaskFailure::new(
        "InvalidArgument",
        "when_any requires at least one task",
    ))
}
