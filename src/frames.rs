//! Frames written by the engine itself rather than by user continuations.

use crate::error::{FlowError, FlowResult};
use crate::id::Id;
use crate::inspect::{FrameReader, FrameWriter, Inspect, Layout};
use crate::resolver::TypeAlias;
use crate::surrogate::ChildRef;
use crate::task::{combine_all, first_finished};
use crate::types::Completion;

pub(crate) const CHILD_ALIAS: &str = "hibernate.child";
pub(crate) const LEAF_ALIAS: &str = "hibernate.leaf";
pub(crate) const WHEN_ALL_ALIAS: &str = "hibernate.when_all";
pub(crate) const WHEN_ANY_ALIAS: &str = "hibernate.when_any";

/// A bare suspension with no continuation around it. Resuming it completes
/// the frame with the delivered outcome.
pub(crate) struct LeafFrame;

impl Inspect for LeafFrame {
    fn layout() -> FlowResult<Layout> {
        Ok(Layout::new())
    }

    fn dehydrate(&self, _w: &mut FrameWriter<'_>) -> FlowResult<()> {
        Ok(())
    }

    fn hydrate(_r: &FrameReader<'_>) -> FlowResult<Self> {
        Ok(LeafFrame)
    }
}

/// Join point of a `when_all`.
///
/// `slots` holds the outcomes that already arrived, in child order;
/// `children` references the children still running.
pub(crate) struct AllFrame {
    pub slots: Vec<Option<Completion>>,
    pub children: Vec<ChildRef>,
}

impl AllFrame {
    /// Record the outcome of the child at `slot`. Returns the combined
    /// outcome once no child is left running.
    pub fn complete(
        &mut self,
        step_id: Id,
        slot: u32,
        outcome: Completion,
    ) -> FlowResult<Option<Completion>> {
        take_pending(&mut self.children, step_id, slot)?;
        let Some(entry) = self.slots.get_mut(slot as usize) else {
            return Err(not_pending(step_id, slot));
        };
        *entry = Some(outcome);

        if !self.children.is_empty() {
            return Ok(None);
        }
        let outcomes = self
            .slots
            .drain(..)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FlowError::NotResumable {
                step_id,
                reason: "an outcome is missing although no child is running".to_string(),
            })?;
        Ok(Some(combine_all(outcomes)))
    }
}

impl Inspect for AllFrame {
    fn layout() -> FlowResult<Layout> {
        Ok(Layout::new().user("slots").user("children"))
    }

    fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()> {
        let child_type = w.resolver().type_id::<ChildRef>()?.clone();
        w.user("slots", &self.slots)?;
        w.surrogate_array("children", child_type, &self.children)
    }

    fn hydrate(r: &FrameReader<'_>) -> FlowResult<Self> {
        Ok(Self {
            slots: r.user("slots")?,
            children: r.surrogate_array("children")?,
        })
    }
}

/// Join point of a `when_any`. Completes with the first child outcome that
/// arrives; the frame is then consumed and later arrivals detach.
pub(crate) struct AnyFrame {
    pub children: Vec<ChildRef>,
}

impl AnyFrame {
    pub fn complete(&mut self, step_id: Id, slot: u32, outcome: Completion) -> FlowResult<Completion> {
        take_pending(&mut self.children, step_id, slot)?;
        Ok(first_finished(slot as usize, outcome))
    }
}

impl Inspect for AnyFrame {
    fn layout() -> FlowResult<Layout> {
        Ok(Layout::new().user("children"))
    }

    fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()> {
        let child_type = w.resolver().type_id::<ChildRef>()?.clone();
        w.surrogate_array("children", child_type, &self.children)
    }

    fn hydrate(r: &FrameReader<'_>) -> FlowResult<Self> {
        Ok(Self {
            children: r.surrogate_array("children")?,
        })
    }
}

fn take_pending(children: &mut Vec<ChildRef>, step_id: Id, slot: u32) -> FlowResult<ChildRef> {
    let position = children
        .iter()
        .position(|child| child.slot == Some(slot))
        .ok_or_else(|| not_pending(step_id, slot))?;
    Ok(children.remove(position))
}

fn not_pending(step_id: Id, slot: u32) -> FlowError {
    FlowError::NotResumable {
        step_id,
        reason: format!("child {slot} is not pending"),
    }
}

/// Which built-in frame a stored alias names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuiltinKind {
    Leaf,
    All,
    Any,
}

/// Alias and cached layout of one built-in frame type.
#[derive(Debug)]
pub(crate) struct BuiltinFrame {
    pub alias: TypeAlias,
    pub layout: Layout,
}

#[derive(Debug)]
pub(crate) struct BuiltinFrames {
    leaf: BuiltinFrame,
    all: BuiltinFrame,
    any: BuiltinFrame,
}

impl BuiltinFrames {
    pub fn new() -> FlowResult<Self> {
        let frame = |alias: &str, layout: Layout| -> FlowResult<BuiltinFrame> {
            let alias = TypeAlias::try_new(alias)?;
            layout.validate(&alias)?;
            Ok(BuiltinFrame { alias, layout })
        };
        Ok(Self {
            leaf: frame(LEAF_ALIAS, LeafFrame::layout()?)?,
            all: frame(WHEN_ALL_ALIAS, AllFrame::layout()?)?,
            any: frame(WHEN_ANY_ALIAS, AnyFrame::layout()?)?,
        })
    }

    pub fn get(&self, kind: BuiltinKind) -> &BuiltinFrame {
        match kind {
            BuiltinKind::Leaf => &self.leaf,
            BuiltinKind::All => &self.all,
            BuiltinKind::Any => &self.any,
        }
    }

    pub fn kind_of(&self, alias: &TypeAlias) -> Option<BuiltinKind> {
        [BuiltinKind::Leaf, BuiltinKind::All, BuiltinKind::Any]
            .into_iter()
            .find(|kind| &self.get(*kind).alias == alias)
    }
}
