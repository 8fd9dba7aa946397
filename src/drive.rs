//! Synchronous stepping of task trees.
//!
//! A [`Driver`] runs computations until each branch either completes or
//! reaches a suspension point. It never touches the stores: every frame,
//! reminder and callback it produces is collected in a [`Batch`] that the
//! engine commits afterwards.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

use crate::config::FlowConfig;
use crate::context::StepContext;
use crate::error::{FlowError, FlowResult};
use crate::frames::{AllFrame, AnyFrame, BuiltinKind, LeafFrame};
use crate::id::Id;
use crate::inspect::{Awaiting, FrameEnvelope, FrameReader, FrameWriter, Inspect, Wake};
use crate::resolver::TypeAlias;
use crate::store::{ParentLink, StoredFrame};
use crate::surrogate::{ChildRef, ServiceScope, SurrogateContext};
use crate::task::{
    Advance, ErasedContinuation, Leaf, Resumption, SuspendCallback, TaskNode, combine_all,
    empty_when_any, first_finished,
};
use crate::types::{Completion, Reminder};

/// A frame to write. `replaces` holds the previous content when an
/// aggregator is rewritten in place.
pub(crate) struct PendingFrame {
    pub step_id: Id,
    pub type_id: TypeAlias,
    pub frame: StoredFrame,
    pub replaces: Option<StoredFrame>,
}

pub(crate) struct PendingCallback {
    pub step_id: Id,
    pub callback: Arc<dyn SuspendCallback>,
}

/// Side effects of one drive, applied by the engine in order.
#[derive(Default)]
pub(crate) struct Batch {
    pub frames: Vec<PendingFrame>,
    pub callbacks: Vec<PendingCallback>,
    pub reminders: Vec<Reminder>,
    /// Steps that never got a frame but may still be named as a parent by
    /// orphaned `when_any` children.
    pub consumed: Vec<Id>,
}

impl Batch {
    /// Step ids of frames created (not rewritten) by this drive.
    pub fn created(&self) -> Vec<Id> {
        self.frames
            .iter()
            .filter(|pending| pending.replaces.is_none())
            .map(|pending| pending.step_id)
            .collect()
    }
}

pub(crate) enum Driven {
    Done(Completion),
    Pending(Id),
}

/// Result of handing a child outcome to its parent frame.
pub(crate) enum Delivered {
    /// The parent frame is finished with and must be consumed.
    Consumed(Driven),
    /// An aggregator recorded the outcome and keeps waiting.
    Waiting,
}

pub(crate) struct Driver<'a> {
    config: &'a FlowConfig,
    services: &'a ServiceScope,
    flow_id: Id,
    now: DateTime<Utc>,
    cancel_requested: bool,
    batch: Batch,
}

impl<'a> Driver<'a> {
    pub fn new(
        config: &'a FlowConfig,
        services: &'a ServiceScope,
        flow_id: Id,
        cancel_requested: bool,
    ) -> Self {
        Self {
            config,
            services,
            flow_id,
            now: Utc::now(),
            cancel_requested,
            batch: Batch::default(),
        }
    }

    pub fn into_batch(self) -> Batch {
        self.batch
    }

    fn surrogate_cx(&self) -> SurrogateContext<'a> {
        SurrogateContext::new(self.config.resolver(), self.flow_id, self.services)
    }

    /// Run `node` until it completes or every branch suspended.
    pub fn drive(&mut self, node: TaskNode, link: Option<ParentLink>) -> FlowResult<Driven> {
        match node {
            TaskNode::Ready(outcome) => Ok(Driven::Done(outcome)),
            TaskNode::Leaf(leaf) => {
                let step_id = Id::new_step();
                let awaiting = self.register_leaf(step_id, leaf)?;
                self.persist_builtin(step_id, BuiltinKind::Leaf, &LeafFrame, awaiting, link, None)?;
                Ok(Driven::Pending(step_id))
            }
            TaskNode::All(children) => self.drive_all(children, link),
            TaskNode::Any(children) => self.drive_any(children, link),
            TaskNode::Continuation(continuation) => {
                self.run_continuation(continuation, Resumption::Start, None, link)
            }
        }
    }

    fn drive_all(&mut self, children: Vec<TaskNode>, link: Option<ParentLink>) -> FlowResult<Driven> {
        if children.is_empty() {
            return Ok(Driven::Done(combine_all(Vec::new())));
        }
        let step_id = Id::new_step();
        let mut slots = Vec::with_capacity(children.len());
        let mut pending = Vec::new();
        for (index, child) in children.into_iter().enumerate() {
            let slot = slot_number(index)?;
            match self.drive(child, Some(ParentLink::new(step_id, Some(slot))))? {
                Driven::Done(outcome) => slots.push(Some(outcome)),
                Driven::Pending(child_step) => {
                    slots.push(None);
                    pending.push(ChildRef::new(self.flow_id, child_step, Some(slot)));
                }
            }
        }

        if pending.is_empty() {
            return Ok(Driven::Done(combine_all(slots.into_iter().flatten().collect())));
        }
        let frame = AllFrame {
            slots,
            children: pending,
        };
        self.persist_builtin(step_id, BuiltinKind::All, &frame, Awaiting::Children, link, None)?;
        Ok(Driven::Pending(step_id))
    }

    fn drive_any(&mut self, children: Vec<TaskNode>, link: Option<ParentLink>) -> FlowResult<Driven> {
        if children.is_empty() {
            return Ok(Driven::Done(empty_when_any()));
        }
        let step_id = Id::new_step();
        let mut winner = None;
        let mut pending = Vec::new();
        for (index, child) in children.into_iter().enumerate() {
            let slot = slot_number(index)?;
            match self.drive(child, Some(ParentLink::new(step_id, Some(slot))))? {
                Driven::Done(outcome) => {
                    if winner.is_none() {
                        winner = Some(first_finished(index, outcome));
                    }
                }
                Driven::Pending(child_step) => {
                    pending.push(ChildRef::new(self.flow_id, child_step, Some(slot)));
                }
            }
        }

        if let Some(outcome) = winner {
            // The losers keep running and will find their parent consumed.
            if !pending.is_empty() {
                self.batch.consumed.push(step_id);
            }
            return Ok(Driven::Done(outcome));
        }
        let frame = AnyFrame { children: pending };
        self.persist_builtin(step_id, BuiltinKind::Any, &frame, Awaiting::Children, link, None)?;
        Ok(Driven::Pending(step_id))
    }

    /// Step a continuation until it finishes or suspends.
    ///
    /// An awaited leaf is folded into the continuation's own frame, so a
    /// computation waiting for an external result persists one frame.
    pub fn run_continuation(
        &mut self,
        mut continuation: Box<dyn ErasedContinuation>,
        mut input: Resumption,
        resumed: Option<Id>,
        link: Option<ParentLink>,
    ) -> FlowResult<Driven> {
        loop {
            let advance = {
                let mut cx = StepContext::new(
                    self.flow_id,
                    resumed,
                    self.now,
                    self.config.resolver(),
                    self.services,
                    self.cancel_requested,
                );
                continuation.advance(&mut cx, input)
            };
            let node = match advance {
                Advance::Done(outcome) => return Ok(Driven::Done(outcome)),
                Advance::Await(node) => node,
            };

            match node {
                TaskNode::Ready(outcome) => input = outcome.into(),
                TaskNode::Leaf(leaf) => {
                    let step_id = Id::new_step();
                    let awaiting = self.register_leaf(step_id, leaf)?;
                    self.persist_continuation(step_id, continuation.as_ref(), awaiting, link)?;
                    return Ok(Driven::Pending(step_id));
                }
                node => {
                    let step_id = Id::new_step();
                    match self.drive(node, Some(ParentLink::new(step_id, None)))? {
                        Driven::Done(outcome) => input = outcome.into(),
                        Driven::Pending(child) => {
                            let awaiting = Awaiting::Child { step: child };
                            self.persist_continuation(step_id, continuation.as_ref(), awaiting, link)?;
                            return Ok(Driven::Pending(step_id));
                        }
                    }
                }
            }
        }
    }

    /// Complete the externally resumable frame at `step_id` with `outcome`.
    pub fn resume_external(
        &mut self,
        step_id: Id,
        envelope: &FrameEnvelope,
        link: Option<ParentLink>,
        outcome: Completion,
    ) -> FlowResult<Driven> {
        match self.config.frames.kind_of(&envelope.type_id) {
            Some(BuiltinKind::Leaf) => Ok(Driven::Done(outcome)),
            Some(BuiltinKind::All | BuiltinKind::Any) => Err(FlowError::NotResumable {
                step_id,
                reason: "the frame waits for child computations".to_string(),
            }),
            None => {
                let continuation = self.hydrate(envelope)?;
                self.run_continuation(continuation, outcome.into(), Some(step_id), link)
            }
        }
    }

    /// Hand the outcome of a child to the frame stored at `step_id`.
    pub fn deliver(
        &mut self,
        step_id: Id,
        envelope: &FrameEnvelope,
        stored: &StoredFrame,
        slot: Option<u32>,
        outcome: Completion,
    ) -> FlowResult<Delivered> {
        if matches!(envelope.awaiting, Awaiting::External { .. }) {
            return Err(FlowError::NotResumable {
                step_id,
                reason: "the frame does not wait for a child computation".to_string(),
            });
        }

        match (self.config.frames.kind_of(&envelope.type_id), slot) {
            (Some(BuiltinKind::All), Some(slot)) => {
                let mut frame: AllFrame = self.hydrate_builtin(BuiltinKind::All, envelope)?;
                match frame.complete(step_id, slot, outcome)? {
                    Some(combined) => Ok(Delivered::Consumed(Driven::Done(combined))),
                    None => {
                        self.persist_builtin(
                            step_id,
                            BuiltinKind::All,
                            &frame,
                            Awaiting::Children,
                            stored.parent,
                            Some(stored.clone()),
                        )?;
                        Ok(Delivered::Waiting)
                    }
                }
            }
            (Some(BuiltinKind::Any), Some(slot)) => {
                let mut frame: AnyFrame = self.hydrate_builtin(BuiltinKind::Any, envelope)?;
                let first = frame.complete(step_id, slot, outcome)?;
                if !frame.children.is_empty() {
                    tracing::debug!(
                        step_id = %step_id,
                        remaining = frame.children.len(),
                        "when_any completed, remaining children detach"
                    );
                }
                Ok(Delivered::Consumed(Driven::Done(first)))
            }
            (None, None) => {
                let continuation = self.hydrate(envelope)?;
                let driven =
                    self.run_continuation(continuation, outcome.into(), Some(step_id), stored.parent)?;
                Ok(Delivered::Consumed(driven))
            }
            (_, slot) => Err(FlowError::shape(
                &envelope.type_id,
                format!("child result for slot {slot:?} does not match the frame"),
            )),
        }
    }

    fn hydrate(&self, envelope: &FrameEnvelope) -> FlowResult<Box<dyn ErasedContinuation>> {
        let config = self.config;
        let descriptor = config.descriptors().get(&envelope.type_id)?;
        let reader = FrameReader::new(
            descriptor.alias(),
            descriptor.layout(),
            config.surrogates(),
            self.surrogate_cx(),
            &envelope.fields,
            envelope.awaiter,
        );
        descriptor.hydrate(&reader)
    }

    fn hydrate_builtin<F: Inspect>(&self, kind: BuiltinKind, envelope: &FrameEnvelope) -> FlowResult<F> {
        let config = self.config;
        let builtin = config.frames.get(kind);
        let reader = FrameReader::new(
            &builtin.alias,
            &builtin.layout,
            config.surrogates(),
            self.surrogate_cx(),
            &envelope.fields,
            envelope.awaiter,
        );
        F::hydrate(&reader)
    }

    fn register_leaf(&mut self, step_id: Id, leaf: Leaf) -> FlowResult<Awaiting> {
        let expects = leaf.expects().alias(self.config.resolver())?;
        let wake = match leaf {
            Leaf::Suspend { callback, .. } => {
                self.batch.callbacks.push(PendingCallback { step_id, callback });
                Wake::Signal
            }
            Leaf::Delay(duration) => {
                let due = TimeDelta::from_std(duration)
                    .ok()
                    .and_then(|delta| self.now.checked_add_signed(delta))
                    .ok_or_else(|| FlowError::InvalidConfiguration {
                        reason: format!("delay of {duration:?} is out of range"),
                    })?;
                self.remind(step_id, due);
                Wake::Timer
            }
            Leaf::Yield => {
                self.remind(step_id, self.now);
                Wake::Yield
            }
        };
        Ok(Awaiting::External { expects, wake })
    }

    fn remind(&mut self, step_id: Id, due: DateTime<Utc>) {
        self.batch.reminders.push(Reminder {
            flow_id: self.flow_id,
            step_id,
            due,
        });
    }

    fn persist_continuation(
        &mut self,
        step_id: Id,
        continuation: &dyn ErasedContinuation,
        awaiting: Awaiting,
        link: Option<ParentLink>,
    ) -> FlowResult<()> {
        let config = self.config;
        let (rust_type, type_name) = continuation.rust_type();
        let descriptor = config.descriptors().for_type(rust_type, type_name)?;
        let mut writer = FrameWriter::new(
            descriptor.alias(),
            descriptor.layout(),
            config.surrogates(),
            self.surrogate_cx(),
        );
        continuation.dehydrate(&mut writer)?;
        self.seal(step_id, descriptor.alias(), writer, awaiting, link, None)
    }

    fn persist_builtin<F: Inspect>(
        &mut self,
        step_id: Id,
        kind: BuiltinKind,
        frame: &F,
        awaiting: Awaiting,
        link: Option<ParentLink>,
        replaces: Option<StoredFrame>,
    ) -> FlowResult<()> {
        let config = self.config;
        let builtin = config.frames.get(kind);
        let mut writer = FrameWriter::new(
            &builtin.alias,
            &builtin.layout,
            config.surrogates(),
            self.surrogate_cx(),
        );
        frame.dehydrate(&mut writer)?;
        self.seal(step_id, &builtin.alias, writer, awaiting, link, replaces)
    }

    fn seal(
        &mut self,
        step_id: Id,
        type_id: &TypeAlias,
        writer: FrameWriter<'_>,
        awaiting: Awaiting,
        parent: Option<ParentLink>,
        replaces: Option<StoredFrame>,
    ) -> FlowResult<()> {
        let (fields, awaiter) = writer.finish()?;
        let envelope = FrameEnvelope::seal(type_id.clone(), awaiter, awaiting, fields)?;
        self.batch.frames.push(PendingFrame {
            step_id,
            type_id: type_id.clone(),
            frame: StoredFrame {
                flow_id: self.flow_id,
                parent,
                bytes: envelope.to_bytes()?,
            },
            replaces,
        });
        Ok(())
    }
}

fn slot_number(index: usize) -> FlowResult<u32> {
    u32::try_from(index).map_err(|_| FlowError::InvalidConfiguration {
        reason: format!("too many child tasks: {index}"),
    })
}
