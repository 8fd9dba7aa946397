use serde::{Deserialize, Serialize};
use std::any::Any;

use super::{Surrogate, SurrogateContext, Surrogator};
use crate::error::{FlowResult, SurrogateError};
use crate::id::Id;

/// Reference to a live child computation of the current flow.
///
/// Aggregating frames (`when_all`, `when_any`) keep one of these per pending
/// child: the step id of the child's outermost frame, whose parent link points
/// back at the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildRef {
    pub flow_id: Id,
    pub step_id: Id,
    /// Position of the child within its aggregator, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
}

impl ChildRef {
    pub fn new(flow_id: Id, step_id: Id, slot: Option<u32>) -> Self {
        Self {
            flow_id,
            step_id,
            slot,
        }
    }
}

/// The "child-computation" surrogator.
///
/// Tokens only restore inside the flow that captured them; a child reference
/// smuggled into another flow fails with [`SurrogateError::ForeignChild`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ChildSurrogator;

impl Surrogator for ChildSurrogator {
    fn name(&self) -> &str {
        "child-computation"
    }

    fn try_surrogate(
        &self,
        value: &dyn Any,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Surrogate>> {
        let Some(child) = value.downcast_ref::<ChildRef>() else {
            return Ok(None);
        };
        let type_id = cx.resolver.type_id::<ChildRef>()?.clone();
        Ok(Some(Surrogate::new(type_id, serde_json::to_value(child)?)))
    }

    fn try_restore(
        &self,
        token: &Surrogate,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Box<dyn Any + Send>>> {
        if !cx.resolver.is::<ChildRef>(&token.type_id) {
            return Ok(None);
        }
        let child: ChildRef =
            serde_json::from_value(token.payload.clone()).map_err(|e| SurrogateError::Shape {
                type_id: token.type_id.clone(),
                reason: e.to_string(),
            })?;
        if child.flow_id != cx.flow_id {
            return Err(SurrogateError::ForeignChild {
                step_id: child.step_id,
                owner: child.flow_id,
                current: cx.flow_id,
            }
            .into());
        }
        Ok(Some(Box::new(child)))
    }
}
