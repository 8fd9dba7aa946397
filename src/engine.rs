use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::FlowConfig;
use crate::drive::{Batch, Delivered, Driven, Driver, PendingCallback, PendingFrame};
use crate::error::{FlowError, FlowResult, TaskFailure};
use crate::host::{FlowHost, NoopHost};
use crate::id::Id;
use crate::inspect::{Awaiting, FrameEnvelope};
use crate::store::{HeapStore, MemoryHeapStore, MemoryStackStore, StackStore, StoredFrame, keys};
use crate::surrogate::ServiceScope;
use crate::task::{Signal, SuspendPoint, Task, TaskNode};
use crate::types::{Completion, FlowRecord, FlowStatus, Outcome, Reminder, ResumeOutcome};

/// Per-flow mutual exclusion. Entries are dropped once nobody holds or
/// waits for them.
#[derive(Default)]
struct FlowLocks {
    locks: DashMap<Id, Arc<Mutex<()>>>,
}

impl FlowLocks {
    async fn acquire(self: &Arc<Self>, flow_id: Id) -> FlowGuard {
        let lock = Arc::clone(&self.locks.entry(flow_id).or_default());
        let guard = lock.lock_owned().await;
        FlowGuard {
            locks: Arc::clone(self),
            flow_id,
            guard: Some(guard),
        }
    }
}

struct FlowGuard {
    locks: Arc<FlowLocks>,
    flow_id: Id,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.flow_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Result of looking up a step's frame.
enum FrameLookup {
    Live(StoredFrame),
    Consumed,
    Missing,
}

/// How a call ended, before its effects are applied.
enum Settle {
    Suspended,
    Waiting,
    Detached,
    Completed(Completion),
}

/// Effects of a call that run after the flow lock is released.
struct Applied {
    outcome: ResumeOutcome,
    created: Vec<Id>,
    callbacks: Vec<PendingCallback>,
}

impl Applied {
    fn done(outcome: ResumeOutcome) -> Self {
        Self {
            outcome,
            created: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

impl From<Driven> for Settle {
    fn from(driven: Driven) -> Self {
        match driven {
            Driven::Done(outcome) => Settle::Completed(outcome),
            Driven::Pending(_) => Settle::Suspended,
        }
    }
}

/// The flow engine: starts computations, persists their frames when they
/// suspend and resumes them when a trigger arrives for a step id.
///
/// Calls touching the same flow are serialized; calls on different flows
/// run concurrently. Cloning is cheap; clones share stores, configuration
/// and locks.
///
/// # Example
///
/// ```ignore
/// let engine = FlowEngine::builder()
///     .config(FlowConfig::builder().continuation::<Checkout>().build()?)
///     .stack_store(Arc::new(MemoryStackStore::new()))
///     .heap_store(Arc::new(MemoryHeapStore::new()))
///     .build()?;
///
/// let started = engine.start(Task::from_continuation(Checkout::new(cart))).await?;
/// let step_id = started.pending()[0];
///
/// // later, maybe in another process:
/// let resumed = engine.resume_with(step_id, &receipt).await?;
/// ```
pub struct FlowEngine<H: FlowHost = NoopHost> {
    config: Arc<FlowConfig>,
    stack: Arc<dyn StackStore>,
    heap: Arc<dyn HeapStore>,
    host: Arc<H>,
    services: Arc<ServiceScope>,
    locks: Arc<FlowLocks>,
}

impl<H: FlowHost> Clone for FlowEngine<H> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            stack: Arc::clone(&self.stack),
            heap: Arc::clone(&self.heap),
            host: Arc::clone(&self.host),
            services: Arc::clone(&self.services),
            locks: Arc::clone(&self.locks),
        }
    }
}

/// Builder for configuring a [`FlowEngine`].
///
/// Stores default to the in-memory implementations and the configuration
/// defaults to one with only the built-in types registered.
pub struct FlowEngineBuilder<H = NoopHost> {
    config: Option<Arc<FlowConfig>>,
    stack: Option<Arc<dyn StackStore>>,
    heap: Option<Arc<dyn HeapStore>>,
    services: ServiceScope,
    host: H,
}

impl Default for FlowEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            stack: None,
            heap: None,
            services: ServiceScope::default(),
            host: NoopHost,
        }
    }
}

impl<H: FlowHost> FlowEngineBuilder<H> {
    pub fn config(mut self, config: impl Into<Arc<FlowConfig>>) -> Self {
        self.config = Some(config.into());
        self
    }

    pub fn stack_store<S: StackStore>(mut self, store: Arc<S>) -> Self {
        self.stack = Some(store as Arc<dyn StackStore>);
        self
    }

    pub fn heap_store<S: HeapStore>(mut self, store: Arc<S>) -> Self {
        self.heap = Some(store as Arc<dyn HeapStore>);
        self
    }

    /// Services injected into continuations of this engine.
    pub fn services(mut self, scope: ServiceScope) -> Self {
        self.services = scope;
        self
    }

    /// Use `host` for lifecycle hooks.
    pub fn host<H2: FlowHost>(self, host: H2) -> FlowEngineBuilder<H2> {
        FlowEngineBuilder {
            config: self.config,
            stack: self.stack,
            heap: self.heap,
            services: self.services,
            host,
        }
    }

    pub fn build(self) -> FlowResult<FlowEngine<H>> {
        let config = match self.config {
            Some(config) => config,
            None => Arc::new(FlowConfig::builder().build()?),
        };
        let stack: Arc<dyn StackStore> = match self.stack {
            Some(stack) => stack,
            None => Arc::new(MemoryStackStore::new()),
        };
        let heap: Arc<dyn HeapStore> = match self.heap {
            Some(heap) => heap,
            None => Arc::new(MemoryHeapStore::new()),
        };
        Ok(FlowEngine {
            config,
            stack,
            heap,
            host: Arc::new(self.host),
            services: Arc::new(self.services),
            locks: Arc::new(FlowLocks::default()),
        })
    }
}

impl FlowEngine {
    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::new()
    }
}

impl<H: FlowHost> FlowEngine<H> {
    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn stack(&self) -> &Arc<dyn StackStore> {
        &self.stack
    }

    pub fn heap(&self) -> &Arc<dyn HeapStore> {
        &self.heap
    }

    pub fn services(&self) -> &ServiceScope {
        &self.services
    }

    /// Start a new flow running `task`.
    ///
    /// The task runs until it completes or every branch suspended. The
    /// returned outcome is `Completed` or `Suspended` with the step ids that
    /// are now waiting for a trigger.
    #[cfg_attr(
        feature = "telemetry",
        tracing::instrument(
            name = "hibernate.flow.start",
            skip(self, task),
            fields(flow_id = tracing::field::Empty)
        )
    )]
    pub async fn start<T>(&self, task: Task<T>) -> FlowResult<ResumeOutcome> {
        let flow_id = Id::new_flow();
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("flow_id", tracing::field::display(flow_id));

        let started = Instant::now();
        let result = self
            .bracketed(flow_id, self.start_flow(flow_id, task.node))
            .await;
        observe("start", started, &result);
        result
    }

    /// Deliver `signal` to the suspended step `step_id` and run the flow
    /// until it suspends again or completes.
    ///
    /// Each step id is consumed by the first successful resume: repeating
    /// the call fails with [`FlowError::StepConsumed`], as does resuming a
    /// step of a flow that already finished. If the call fails before its
    /// effects are applied, the flow keeps the status it had.
    #[cfg_attr(
        feature = "telemetry",
        tracing::instrument(
            name = "hibernate.flow.resume",
            skip(self, signal),
            fields(step_id = %step_id, flow_id = tracing::field::Empty)
        )
    )]
    pub async fn resume(&self, step_id: Id, signal: Signal) -> FlowResult<ResumeOutcome> {
        let started = Instant::now();
        let result = self.resume_step(step_id, signal).await;
        observe("resume", started, &result);
        result
    }

    /// Resume with a typed value, tagged with its registered alias.
    pub async fn resume_with<T>(&self, step_id: Id, value: &T) -> FlowResult<ResumeOutcome>
    where
        T: Serialize + Sync + 'static,
    {
        let signal = Signal::typed(self.config.resolver(), value)?;
        self.resume(step_id, signal).await
    }

    /// Resume a step as faulted with `error`.
    pub async fn fail_step(&self, step_id: Id, error: anyhow::Error) -> FlowResult<ResumeOutcome> {
        let failure = TaskFailure::from_error(&error);
        self.resume(step_id, Signal::Failed(failure)).await
    }

    /// Resume a step as canceled.
    pub async fn cancel_step(&self, step_id: Id) -> FlowResult<ResumeOutcome> {
        self.resume(step_id, Signal::Canceled).await
    }

    /// Ask a flow to stop. Every later resume of one of its steps delivers
    /// cancellation instead of the trigger's value, and continuations see
    /// [`StepContext::is_cancel_requested`](crate::StepContext::is_cancel_requested).
    ///
    /// Returns `false` if the flow is unknown or already finished.
    pub async fn request_cancel(&self, flow_id: Id) -> FlowResult<bool> {
        let _guard = self.locks.acquire(flow_id).await;
        let Some(record) = self.load_record(flow_id).await? else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        self.heap
            .save(&keys::cancel(flow_id), json!({ "requested_at": Utc::now() }))
            .await
            .map_err(|e| FlowError::store("save", e))?;
        tracing::info!(flow_id = %flow_id, "Cancellation requested");
        Ok(true)
    }

    pub async fn status(&self, flow_id: Id) -> FlowResult<Option<FlowStatus>> {
        Ok(self.load_record(flow_id).await?.map(|record| record.status))
    }

    pub async fn record(&self, flow_id: Id) -> FlowResult<Option<FlowRecord>> {
        self.load_record(flow_id).await
    }

    /// Step ids of every frame currently stored for a flow.
    pub async fn pending_steps(&self, flow_id: Id) -> FlowResult<Vec<Id>> {
        self.stack
            .list(flow_id)
            .await
            .map_err(|e| FlowError::store("list", e))
    }

    /// Reminders due at `now`, earliest first, at most `limit` of them.
    pub async fn due_reminders(&self, now: DateTime<Utc>, limit: usize) -> FlowResult<Vec<Reminder>> {
        let entries = self
            .heap
            .scan(keys::REMINDER_PREFIX)
            .await
            .map_err(|e| FlowError::store("scan", e))?;
        let mut due = Vec::new();
        for (key, value) in entries {
            match serde_json::from_value::<Reminder>(value) {
                Ok(reminder) if reminder.is_due(now) => due.push(reminder),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping malformed reminder {}: {}", key, e),
            }
        }
        due.sort_by_key(|reminder| reminder.due);
        due.truncate(limit);
        Ok(due)
    }

    async fn start_flow(&self, flow_id: Id, node: TaskNode) -> FlowResult<ResumeOutcome> {
        let guard = self.locks.acquire(flow_id).await;
        #[allow(unused_mut)]
        let mut record = FlowRecord::new(flow_id);
        #[cfg(feature = "telemetry")]
        {
            record.trace_context = crate::telemetry::inject_trace_context();
        }
        self.save_record(&record).await?;

        let applied = match self.run_start(flow_id, node).await {
            Ok(applied) => applied,
            Err(err) => {
                let failure = TaskFailure::new("Start", err.to_string());
                self.recover(flow_id, FlowStatus::Faulted, Some(Outcome::Faulted(failure)))
                    .await;
                return Err(err);
            }
        };
        drop(guard);
        self.announce(flow_id, applied).await
    }

    async fn run_start(&self, flow_id: Id, node: TaskNode) -> FlowResult<Applied> {
        self.call_host(flow_id, "started", self.host.started(flow_id))
            .await?;
        self.transition(flow_id, FlowStatus::Running, None).await?;

        #[cfg(feature = "telemetry")]
        crate::telemetry::record_flow_started();
        tracing::info!(flow_id = %flow_id, "Flow started");

        let mut driver = Driver::new(&self.config, &self.services, flow_id, false);
        let driven = driver.drive(node, None)?;
        self.apply(flow_id, driver.into_batch(), driven.into(), Vec::new())
            .await
    }

    async fn resume_step(&self, step_id: Id, signal: Signal) -> FlowResult<ResumeOutcome> {
        // Read once to find the flow; the frame is read again under its lock.
        let flow_id = self.load_frame(step_id).await?.flow_id;
        #[cfg(feature = "telemetry")]
        tracing::Span::current().record("flow_id", tracing::field::display(flow_id));

        self.bracketed(flow_id, self.resume_locked(step_id, flow_id, signal))
            .await
    }

    async fn resume_locked(
        &self,
        step_id: Id,
        flow_id: Id,
        signal: Signal,
    ) -> FlowResult<ResumeOutcome> {
        let guard = self.locks.acquire(flow_id).await;
        let stored = self.load_frame(step_id).await?;
        let previous = self.load_record(flow_id).await?;
        if let Some(record) = &previous
            && record.status.is_terminal()
        {
            tracing::warn!(
                flow_id = %flow_id,
                step_id = %step_id,
                "Frame left behind by a finished flow"
            );
            return Err(FlowError::StepConsumed { step_id });
        }

        let applied = match self.run_resume(step_id, stored, signal).await {
            Ok(applied) => applied,
            Err(err) => {
                let status = previous.map_or(FlowStatus::Suspended, |record| record.status);
                self.recover(flow_id, status, None).await;
                return Err(err);
            }
        };
        drop(guard);
        self.announce(flow_id, applied).await
    }

    async fn run_resume(
        &self,
        step_id: Id,
        stored: StoredFrame,
        signal: Signal,
    ) -> FlowResult<Applied> {
        let flow_id = stored.flow_id;
        let envelope = FrameEnvelope::from_bytes(step_id, &stored.bytes)?;
        let Awaiting::External { expects, .. } = &envelope.awaiting else {
            return Err(FlowError::NotResumable {
                step_id,
                reason: "the frame waits for child computations".to_string(),
            });
        };
        if let Signal::Value { type_id, .. } = &signal
            && type_id != expects
        {
            return Err(FlowError::ResultTypeMismatch {
                step_id,
                expected: expects.clone(),
                actual: type_id.clone(),
            });
        }

        let record = self.transition(flow_id, FlowStatus::Running, None).await?;
        restore_trace_context(&record);
        let cancel_requested = self.is_cancel_requested(flow_id).await?;
        let outcome = if cancel_requested {
            Outcome::Canceled
        } else {
            signal.into_completion()
        };

        let mut consumed = vec![step_id];
        let mut driver = Driver::new(&self.config, &self.services, flow_id, cancel_requested);
        let mut driven = driver.resume_external(step_id, &envelope, stored.parent, outcome)?;
        let mut link = stored.parent;

        let settle = loop {
            let Driven::Done(outcome) = driven else {
                break Settle::Suspended;
            };
            let Some(parent) = link else {
                break Settle::Completed(outcome);
            };

            let parent_frame = match self.find_frame(parent.step).await? {
                FrameLookup::Live(frame) => frame,
                FrameLookup::Consumed => {
                    tracing::debug!(
                        flow_id = %flow_id,
                        step_id = %parent.step,
                        "Parent already completed, result detached"
                    );
                    break Settle::Detached;
                }
                FrameLookup::Missing => {
                    return Err(FlowError::FrameNotFound {
                        step_id: parent.step,
                    });
                }
            };

            let parent_envelope = FrameEnvelope::from_bytes(parent.step, &parent_frame.bytes)?;
            match driver.deliver(
                parent.step,
                &parent_envelope,
                &parent_frame,
                parent.slot,
                outcome,
            )? {
                Delivered::Consumed(next) => {
                    consumed.push(parent.step);
                    driven = next;
                    link = parent_frame.parent;
                }
                Delivered::Waiting => break Settle::Waiting,
            }
        };

        self.apply(flow_id, driver.into_batch(), settle, consumed)
            .await
    }

    /// Apply the effects of a call under the flow lock: persist frames and
    /// reminders, consume finished steps and update the record. A completed
    /// flow also notifies the host here.
    async fn apply(
        &self,
        flow_id: Id,
        batch: Batch,
        settle: Settle,
        mut consumed: Vec<Id>,
    ) -> FlowResult<Applied> {
        consumed.extend(batch.consumed.iter().copied());
        let outcome = match settle {
            Settle::Completed(outcome) => {
                return Ok(Applied::done(self.complete(flow_id, consumed, outcome).await?));
            }
            Settle::Suspended => ResumeOutcome::Suspended {
                flow_id,
                pending: batch.created(),
            },
            Settle::Waiting => ResumeOutcome::Waiting { flow_id },
            Settle::Detached => ResumeOutcome::Detached { flow_id },
        };

        self.commit(flow_id, &batch).await?;
        if let Err(err) = self.consume(&consumed).await {
            let written: Vec<&PendingFrame> = batch.frames.iter().collect();
            self.rollback(&written, &batch.reminders).await;
            return Err(err);
        }
        self.transition(flow_id, FlowStatus::Suspended, None).await?;

        let created = batch.created();
        tracing::debug!(flow_id = %flow_id, created = created.len(), "Flow suspended");
        Ok(Applied {
            outcome,
            created,
            callbacks: batch.callbacks,
        })
    }

    /// Run the `suspended` hook and the suspension callbacks of a call whose
    /// effects are committed. Callbacks fire even if the hook fails; the
    /// hook's error is returned first.
    async fn announce(&self, flow_id: Id, applied: Applied) -> FlowResult<ResumeOutcome> {
        let Applied {
            outcome,
            created,
            callbacks,
        } = applied;
        let hooked = if created.is_empty() {
            Ok(())
        } else {
            self.call_host(flow_id, "suspended", self.host.suspended(flow_id, &created))
                .await
        };
        let notified = self.notify(flow_id, callbacks).await;
        hooked.and(notified).map(|()| outcome)
    }

    /// Put back the status a failed call started from, unless the call got
    /// far enough to settle the flow itself.
    async fn recover(&self, flow_id: Id, status: FlowStatus, outcome: Option<Completion>) {
        let current = match self.load_record(flow_id).await {
            Ok(Some(record)) => record.status,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Failed to reload record of flow {}: {}", flow_id, e);
                return;
            }
        };
        if !matches!(current, FlowStatus::Starting | FlowStatus::Running) || current == status {
            return;
        }
        if current == FlowStatus::Starting
            && let Err(e) = self.transition(flow_id, FlowStatus::Running, None).await
        {
            tracing::error!("Failed to restore status of flow {}: {}", flow_id, e);
            return;
        }
        match self.transition(flow_id, status, outcome).await {
            Ok(_) => tracing::warn!(
                flow_id = %flow_id,
                status = %status,
                "Flow status restored after a failed call"
            ),
            Err(e) => tracing::error!("Failed to restore status of flow {}: {}", flow_id, e),
        }
    }

    async fn commit(&self, flow_id: Id, batch: &Batch) -> FlowResult<()> {
        let started = Instant::now();
        let mut written: Vec<&PendingFrame> = Vec::with_capacity(batch.frames.len());
        for pending in &batch.frames {
            if let Err(e) = self.stack.put(pending.step_id, pending.frame.clone()).await {
                self.rollback(&written, &[]).await;
                return Err(FlowError::store("put", e));
            }
            written.push(pending);
        }

        for (saved_count, reminder) in batch.reminders.iter().enumerate() {
            let saved = match serde_json::to_value(reminder) {
                Ok(value) => self
                    .heap
                    .save(&keys::reminder(reminder.step_id), value)
                    .await
                    .map_err(|e| FlowError::store("save", e)),
                Err(e) => Err(e.into()),
            };
            if let Err(err) = saved {
                self.rollback(&written, &batch.reminders[..saved_count]).await;
                return Err(err);
            }
        }

        #[cfg(feature = "telemetry")]
        {
            for pending in &batch.frames {
                crate::telemetry::record_frame_written(pending.type_id.as_str());
            }
            crate::telemetry::record_commit_duration(
                batch.frames.len(),
                started.elapsed().as_secs_f64(),
            );
        }
        tracing::trace!(
            flow_id = %flow_id,
            frames = batch.frames.len(),
            reminders = batch.reminders.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Committed frames"
        );
        Ok(())
    }

    /// Undo frames and reminders written by a failed call, newest first.
    async fn rollback(&self, written: &[&PendingFrame], reminders: &[Reminder]) {
        for reminder in reminders.iter().rev() {
            if let Err(e) = self.heap.delete(&keys::reminder(reminder.step_id)).await {
                tracing::error!("Failed to roll back reminder {}: {}", reminder.step_id, e);
            }
        }
        for pending in written.iter().rev() {
            let result = match &pending.replaces {
                Some(previous) => self.stack.put(pending.step_id, previous.clone()).await,
                None => self.stack.delete(pending.step_id).await.map(|_| ()),
            };
            if let Err(e) = result {
                tracing::error!(
                    "Failed to roll back frame {} ({}): {}",
                    pending.step_id,
                    pending.type_id,
                    e
                );
            }
        }
    }

    /// Mark steps as consumed, then drop their frames and reminders.
    ///
    /// The markers are the commit point: if one cannot be written, the
    /// markers already written are removed and nothing is consumed. Once all
    /// are written a leftover frame is unreachable, so cleanup failures are
    /// only logged.
    async fn consume(&self, steps: &[Id]) -> FlowResult<()> {
        let now = Utc::now();
        for (marked, &step_id) in steps.iter().enumerate() {
            if let Err(e) = self
                .heap
                .save(&keys::consumed(step_id), json!({ "consumed_at": now }))
                .await
            {
                for &done in steps[..marked].iter().rev() {
                    if let Err(e) = self.heap.delete(&keys::consumed(done)).await {
                        tracing::error!("Failed to unmark consumed step {}: {}", done, e);
                    }
                }
                return Err(FlowError::store("save", e));
            }
        }

        for &step_id in steps {
            if let Err(e) = self.stack.delete(step_id).await {
                tracing::warn!("Failed to delete frame of consumed step {}: {}", step_id, e);
            }
            if let Err(e) = self.heap.delete(&keys::reminder(step_id)).await {
                tracing::warn!("Failed to delete reminder of consumed step {}: {}", step_id, e);
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        flow_id: Id,
        consumed: Vec<Id>,
        outcome: Completion,
    ) -> FlowResult<ResumeOutcome> {
        match &outcome {
            Outcome::Succeeded(value) => {
                self.call_host(flow_id, "succeeded", self.host.succeeded(flow_id, value))
                    .await?
            }
            Outcome::Faulted(failure) => {
                tracing::warn!(flow_id = %flow_id, "Flow faulted: {}", failure);
                self.call_host(flow_id, "failed", self.host.failed(flow_id, failure))
                    .await?
            }
            Outcome::Canceled => {
                self.call_host(flow_id, "canceled", self.host.canceled(flow_id))
                    .await?
            }
        }

        let mut steps = self.pending_steps(flow_id).await?;
        steps.extend(consumed);
        steps.sort();
        steps.dedup();
        self.consume(&steps).await?;
        self.heap
            .delete(&keys::cancel(flow_id))
            .await
            .map_err(|e| FlowError::store("delete", e))?;

        let status = outcome.flow_status();
        self.transition(flow_id, status, Some(outcome.clone()))
            .await?;

        #[cfg(feature = "telemetry")]
        crate::telemetry::record_flow_completed(status.as_str());
        tracing::info!(flow_id = %flow_id, status = %status, "Flow completed");

        Ok(ResumeOutcome::Completed { flow_id, outcome })
    }

    /// Fire suspension callbacks. Every callback runs; the first error is
    /// returned.
    async fn notify(&self, flow_id: Id, callbacks: Vec<PendingCallback>) -> FlowResult<()> {
        let mut first_error = None;
        for PendingCallback { step_id, callback } in callbacks {
            let point = SuspendPoint {
                flow_id,
                step_id,
                heap: Arc::clone(&self.heap),
            };
            if let Err(source) = callback.on_suspended(point).await {
                tracing::error!("Suspension callback failed for step {}: {}", step_id, source);
                first_error.get_or_insert(FlowError::Callback { step_id, source });
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run `op` between the host's `initialize` and `finalize` hooks.
    /// `finalize` runs even if `op` failed.
    async fn bracketed(
        &self,
        flow_id: Id,
        op: impl Future<Output = FlowResult<ResumeOutcome>>,
    ) -> FlowResult<ResumeOutcome> {
        self.call_host(flow_id, "initialize", self.host.initialize(flow_id))
            .await?;
        let result = op.await;
        let finalized = self
            .call_host(flow_id, "finalize", self.host.finalize(flow_id))
            .await;
        match (result, finalized) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), finalized) => {
                if let Err(finalize_err) = finalized {
                    tracing::error!("{}", finalize_err);
                }
                Err(err)
            }
        }
    }

    async fn call_host(
        &self,
        flow_id: Id,
        hook: &'static str,
        call: impl Future<Output = anyhow::Result<()>>,
    ) -> FlowResult<()> {
        call.await.map_err(|source| FlowError::Host {
            hook,
            flow_id,
            source,
        })
    }

    /// Load a live frame. A consumed marker wins over a frame left behind
    /// by an interrupted cleanup.
    async fn load_frame(&self, step_id: Id) -> FlowResult<StoredFrame> {
        match self.find_frame(step_id).await? {
            FrameLookup::Live(frame) => Ok(frame),
            FrameLookup::Consumed => {
                #[cfg(feature = "telemetry")]
                crate::telemetry::record_stale_trigger();
                tracing::debug!(step_id = %step_id, "Trigger for a consumed step");
                Err(FlowError::StepConsumed { step_id })
            }
            FrameLookup::Missing => Err(FlowError::FrameNotFound { step_id }),
        }
    }

    async fn find_frame(&self, step_id: Id) -> FlowResult<FrameLookup> {
        let frame = self
            .stack
            .get(step_id)
            .await
            .map_err(|e| FlowError::store("get", e))?;
        if self.is_consumed(step_id).await? {
            return Ok(FrameLookup::Consumed);
        }
        Ok(frame.map_or(FrameLookup::Missing, FrameLookup::Live))
    }

    async fn is_consumed(&self, step_id: Id) -> FlowResult<bool> {
        Ok(self
            .heap
            .load(&keys::consumed(step_id))
            .await
            .map_err(|e| FlowError::store("load", e))?
            .is_some())
    }

    async fn is_cancel_requested(&self, flow_id: Id) -> FlowResult<bool> {
        Ok(self
            .heap
            .load(&keys::cancel(flow_id))
            .await
            .map_err(|e| FlowError::store("load", e))?
            .is_some())
    }

    async fn load_record(&self, flow_id: Id) -> FlowResult<Option<FlowRecord>> {
        let value = self
            .heap
            .load(&keys::flow(flow_id))
            .await
            .map_err(|e| FlowError::store("load", e))?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    async fn save_record(&self, record: &FlowRecord) -> FlowResult<()> {
        self.heap
            .save(&keys::flow(record.flow_id), serde_json::to_value(record)?)
            .await
            .map_err(|e| FlowError::store("save", e))
    }

    /// Move the stored record to `next`, validating the transition against
    /// the status currently stored.
    async fn transition(
        &self,
        flow_id: Id,
        next: FlowStatus,
        outcome: Option<Completion>,
    ) -> FlowResult<FlowRecord> {
        let mut record = self
            .load_record(flow_id)
            .await?
            .unwrap_or_else(|| FlowRecord::new(flow_id));
        if !record.status.can_transition_to(next) {
            return Err(FlowError::InvalidTransition {
                flow_id,
                from: record.status.as_str(),
                to: next.as_str(),
            });
        }
        record.status = next;
        record.updated_at = Utc::now();
        if outcome.is_some() {
            record.outcome = outcome;
        }
        self.save_record(&record).await?;
        Ok(record)
    }
}

#[allow(unused_variables)]
fn restore_trace_context(record: &FlowRecord) {
    #[cfg(feature = "telemetry")]
    if let Some(headers) = &record.trace_context {
        use tracing_opentelemetry::OpenTelemetrySpanExt;
        tracing::Span::current().set_parent(crate::telemetry::extract_trace_context(headers));
    }
}

fn outcome_label(outcome: &ResumeOutcome) -> &'static str {
    match outcome {
        ResumeOutcome::Suspended { .. } => "suspended",
        ResumeOutcome::Waiting { .. } => "waiting",
        ResumeOutcome::Completed { .. } => "completed",
        ResumeOutcome::Detached { .. } => "detached",
    }
}

fn observe(operation: &'static str, started: Instant, result: &FlowResult<ResumeOutcome>) {
    let label = match result {
        Ok(outcome) => outcome_label(outcome),
        Err(err) if err.is_consumed() => "consumed",
        Err(_) => "error",
    };
    #[cfg(feature = "telemetry")]
    {
        crate::telemetry::record_resume_duration(operation, label, started.elapsed().as_secs_f64());
        if operation == "resume" {
            crate::telemetry::record_step_resumed(label);
        }
    }
    if let Err(err) = result
        && !err.is_consumed()
    {
        tracing::error!("Flow {} failed: {}", operation, err);
    }
    tracing::debug!(
        operation,
        result = label,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Flow call finished"
    );
}
