//! Reflective fallback: layouts discovered from serde derive metadata.
//!
//! For plain-data continuations that derive `Serialize` and `Deserialize`,
//! wrapping the value in [`Reflective`] avoids writing an `Inspect` impl. The
//! field list is read once from the `deserialize_struct` call the derived
//! impl makes; fields skipped by serde are treated as builder fields and
//! restored with their serde default.

use serde::de::{self, Deserializer, Visitor};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

use super::{FieldKind, FrameReader, FrameWriter, Inspect, Layout};
use crate::context::StepContext;
use crate::error::{FlowError, FlowResult, TaskResult};
use crate::resolver::TypeAlias;
use crate::task::{Continuation, Resumption, Step};

/// Name of the field treated as the awaiter discriminator.
pub const DISCRIMINATOR_FIELD: &str = "state";

/// Serde-driven [`Inspect`] implementation for `C`.
///
/// A field named `state` (an unsigned integer) is the awaiter discriminator;
/// all other fields are user fields stored as plain data.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Countdown { state: u32, left: u32 }
///
/// impl Continuation for Countdown { ... }
///
/// let task = Task::from_continuation(Reflective(Countdown { state: 0, left: 3 }));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Reflective<C>(pub C);

impl<C> Reflective<C> {
    pub fn into_inner(self) -> C {
        self.0
    }
}

impl<C> Continuation for Reflective<C>
where
    C: Continuation,
{
    type Output = C::Output;

    fn resume(
        &mut self,
        cx: &mut StepContext<'_>,
        input: Resumption,
    ) -> TaskResult<Step<Self::Output>> {
        self.0.resume(cx, input)
    }
}

impl<C> Inspect for Reflective<C>
where
    C: Serialize + DeserializeOwned + 'static,
{
    fn layout() -> FlowResult<Layout> {
        let alias = TypeAlias::of::<C>();
        let fields = struct_fields::<C>().ok_or_else(|| {
            FlowError::shape(&alias, "reflective layouts need a plain struct with named fields")
        })?;
        Ok(fields.iter().fold(Layout::new(), |layout, &name| {
            if name == DISCRIMINATOR_FIELD {
                layout.awaiter(name)
            } else {
                layout.user(name)
            }
        }))
    }

    fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()> {
        let alias = TypeAlias::of::<C>();
        let JsonValue::Object(mut map) = serde_json::to_value(&self.0)? else {
            return Err(FlowError::shape(&alias, "did not serialize to an object"));
        };
        for field in w.layout().persisted() {
            // Fields skipped when serializing (e.g. `None`) are written as null.
            let value = map.remove(field.name).unwrap_or(JsonValue::Null);
            match field.kind {
                FieldKind::Awaiter => {
                    let position = value
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| {
                            FlowError::shape(&alias, "`state` must be an unsigned 32-bit integer")
                        })?;
                    w.awaiter(field.name, position)?;
                }
                _ => w.json(field.name, value)?,
            }
        }
        Ok(())
    }

    fn hydrate(r: &FrameReader<'_>) -> FlowResult<Self> {
        let mut map = Map::new();
        for field in r.layout().persisted() {
            let value = match field.kind {
                FieldKind::Awaiter => JsonValue::from(r.awaiter(field.name)?),
                _ => r.json(field.name)?,
            };
            map.insert(field.name.to_string(), value);
        }
        let inner = serde_json::from_value(JsonValue::Object(map))
            .map_err(|e| FlowError::shape(&TypeAlias::of::<C>(), e.to_string()))?;
        Ok(Reflective(inner))
    }
}

/// Field names of a derived struct, or `None` if `T` does not deserialize
/// from a struct.
pub fn struct_fields<T: DeserializeOwned>() -> Option<&'static [&'static str]> {
    match T::deserialize(FieldProbe) {
        Err(Probe::Fields(fields)) => Some(fields),
        _ => None,
    }
}

#[derive(Debug)]
enum Probe {
    Fields(&'static [&'static str]),
    Other(String),
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Fields(fields) => write!(f, "struct fields {fields:?}"),
            Probe::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Probe {}

impl de::Error for Probe {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Probe::Other(msg.to_string())
    }
}

/// Deserializer that aborts at the first `deserialize_struct` call, capturing
/// the field list.
struct FieldProbe;

impl<'de> Deserializer<'de> for FieldProbe {
    type Error = Probe;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Probe> {
        Err(Probe::Other("not a struct".to_string()))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, Probe> {
        Err(Probe::Fields(fields))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}
