//! Surrogation: typed tokens for values that cannot be stored as plain data.
//!
//! A frame field that holds a live child computation or an injected service
//! cannot be serialized directly. A [`Surrogator`] converts such a value into
//! a small [`Surrogate`] token `(type alias, payload)` when the frame is
//! dehydrated, and back into an equivalent value when it is hydrated in a
//! compatible [`SurrogateContext`].
//!
//! Surrogators are chained in a [`SurrogateChain`]; the first one that claims a
//! value wins, and a value nobody claims is serialized normally. On the way
//! back a token that no surrogator claims is an error, never silently dropped.

mod child;
mod service;

pub use child::{ChildRef, ChildSurrogator};
pub use service::{Service, ServiceScope, ServiceSurrogator};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::any::{Any, type_name};
use std::sync::Arc;

use crate::error::{FlowError, FlowResult, SurrogateError};
use crate::id::Id;
use crate::resolver::{TypeAlias, TypeResolver};

/// Token standing in for a value that is not stored as plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Surrogate {
    /// Alias of the surrogated type (or `[alias]` for an array token).
    #[serde(rename = "type")]
    pub type_id: TypeAlias,
    /// Surrogator-specific payload.
    pub payload: JsonValue,
}

impl Surrogate {
    pub fn new(type_id: TypeAlias, payload: JsonValue) -> Self {
        Self { type_id, payload }
    }

    /// Whether this token aggregates several items.
    pub fn is_array(&self) -> bool {
        self.type_id.element().is_some()
    }
}

/// Everything a surrogator may consult while capturing or restoring.
///
/// Restoring is only valid in a context equivalent to the one the token was
/// captured in (same flow, same kind of service scope).
#[derive(Clone, Copy)]
pub struct SurrogateContext<'a> {
    pub resolver: &'a TypeResolver,
    pub flow_id: Id,
    pub services: &'a ServiceScope,
}

impl<'a> SurrogateContext<'a> {
    pub fn new(resolver: &'a TypeResolver, flow_id: Id, services: &'a ServiceScope) -> Self {
        Self {
            resolver,
            flow_id,
            services,
        }
    }
}

/// Converts one kind of value to and from [`Surrogate`] tokens.
///
/// Implementations own exactly one responsibility and must satisfy: for every
/// value `v` they claim, `try_restore(try_surrogate(v))` in an equivalent
/// context yields a value behaving like `v`.
pub trait Surrogator: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Produce a token for `value`, or `None` if this surrogator does not
    /// handle values of its type.
    fn try_surrogate(
        &self,
        value: &dyn Any,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Surrogate>>;

    /// Rebuild a value from `token`, or `None` if the token's type is not
    /// handled here. A claimed token with a bad payload or an incompatible
    /// context must return an error.
    fn try_restore(
        &self,
        token: &Surrogate,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Box<dyn Any + Send>>>;
}

/// Ordered list of surrogators; first match wins.
#[derive(Clone, Default)]
pub struct SurrogateChain {
    links: Vec<Arc<dyn Surrogator>>,
}

impl std::fmt::Debug for SurrogateChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl SurrogateChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a surrogator.
    pub fn with(mut self, surrogator: impl Surrogator + 'static) -> Self {
        self.links.push(Arc::new(surrogator));
        self
    }

    pub fn push(&mut self, surrogator: Arc<dyn Surrogator>) {
        self.links.push(surrogator);
    }

    /// Names of the chained surrogators, in order.
    pub fn names(&self) -> Vec<&str> {
        self.links.iter().map(|s| s.name()).collect()
    }

    /// Try every surrogator in order.
    pub fn try_surrogate(
        &self,
        value: &dyn Any,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Surrogate>> {
        for link in &self.links {
            if let Some(token) = link.try_surrogate(value, cx)? {
                return Ok(Some(token));
            }
        }
        Ok(None)
    }

    /// Surrogate a value that has no plain representation.
    pub fn surrogate<T: Any>(&self, value: &T, cx: &SurrogateContext<'_>) -> FlowResult<Surrogate> {
        self.try_surrogate(value, cx)?.ok_or_else(|| {
            SurrogateError::NotSurrogatable {
                type_name: type_name::<T>(),
            }
            .into()
        })
    }

    /// Restore a single-value token.
    pub fn restore(
        &self,
        token: &Surrogate,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Box<dyn Any + Send>> {
        if token.is_array() {
            let items = self.restore_items(token, cx)?;
            return Ok(Box::new(items));
        }
        for link in &self.links {
            if let Some(value) = link.try_restore(token, cx)? {
                return Ok(value);
            }
        }
        Err(SurrogateError::Unclaimed {
            type_id: token.type_id.clone(),
        }
        .into())
    }

    /// Restore a single-value token as `T`.
    pub fn restore_as<T: Any>(&self, token: &Surrogate, cx: &SurrogateContext<'_>) -> FlowResult<T> {
        let value = self.restore(token, cx)?;
        downcast(value, &token.type_id)
    }

    /// Start an aggregate token for `count` items of `item_type`.
    pub fn begin_array<'c, 'a>(
        &'c self,
        item_type: TypeAlias,
        count: usize,
        cx: &'c SurrogateContext<'a>,
    ) -> SurrogateArray<'c, 'a> {
        SurrogateArray {
            chain: self,
            cx,
            item_type,
            expected: count,
            items: Vec::with_capacity(count),
        }
    }

    /// Restore every item of an aggregate token as `T`.
    pub fn restore_array<T: Any>(
        &self,
        token: &Surrogate,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Vec<T>> {
        let element = token.type_id.element().ok_or_else(|| SurrogateError::Shape {
            type_id: token.type_id.clone(),
            reason: "expected an array token".to_string(),
        })?;
        self.restore_items(token, cx)?
            .into_iter()
            .map(|item| downcast(item, &element))
            .collect()
    }

    fn restore_items(
        &self,
        token: &Surrogate,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Vec<Box<dyn Any + Send>>> {
        let element = token.type_id.element().ok_or_else(|| SurrogateError::Shape {
            type_id: token.type_id.clone(),
            reason: "expected an array token".to_string(),
        })?;
        let JsonValue::Array(payloads) = &token.payload else {
            return Err(SurrogateError::Shape {
                type_id: token.type_id.clone(),
                reason: "array payload must be a list".to_string(),
            }
            .into());
        };
        payloads
            .iter()
            .map(|payload| self.restore(&Surrogate::new(element.clone(), payload.clone()), cx))
            .collect()
    }
}

fn downcast<T: Any>(value: Box<dyn Any + Send>, type_id: &TypeAlias) -> FlowResult<T> {
    value
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| {
            FlowError::from(SurrogateError::Downcast {
                type_id: type_id.clone(),
                expected: type_name::<T>(),
            })
        })
}

/// Aggregate token under construction. See [`SurrogateChain::begin_array`].
pub struct SurrogateArray<'c, 'a> {
    chain: &'c SurrogateChain,
    cx: &'c SurrogateContext<'a>,
    item_type: TypeAlias,
    expected: usize,
    items: Vec<JsonValue>,
}

impl SurrogateArray<'_, '_> {
    /// Surrogate one item. Every item must produce a token of the declared type.
    pub fn write_item(&mut self, value: &dyn Any) -> FlowResult<()> {
        let token = self
            .chain
            .try_surrogate(value, self.cx)?
            .ok_or_else(|| SurrogateError::Shape {
                type_id: self.item_type.array_of(),
                reason: format!("item {} has no surrogator", self.items.len()),
            })?;
        if token.type_id != self.item_type {
            return Err(SurrogateError::Shape {
                type_id: self.item_type.array_of(),
                reason: format!(
                    "item {} surrogated as `{}`",
                    self.items.len(),
                    token.type_id
                ),
            }
            .into());
        }
        self.items.push(token.payload);
        Ok(())
    }

    /// Finish the aggregate token, checking the declared item count.
    pub fn end_array(self) -> FlowResult<Surrogate> {
        if self.items.len() != self.expected {
            return Err(SurrogateError::ArrayLength {
                type_id: self.item_type,
                expected: self.expected,
                actual: self.items.len(),
            }
            .into());
        }
        Ok(Surrogate::new(
            self.item_type.array_of(),
            JsonValue::Array(self.items),
        ))
    }
}
