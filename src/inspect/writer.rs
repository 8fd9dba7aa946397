use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};

use super::{FieldKind, Layout};
use crate::error::{FlowError, FlowResult};
use crate::id::Id;
use crate::resolver::{TypeAlias, TypeResolver};
use crate::surrogate::{Surrogate, SurrogateChain, SurrogateContext};

pub(crate) const FRAME_VERSION: u32 = 1;

/// A stored field: plain data or a surrogate token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    Plain(JsonValue),
    Surrogate(Surrogate),
}

/// What a persisted frame is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "on", rename_all = "snake_case")]
pub(crate) enum Awaiting {
    /// An external trigger carrying a value of type `expects`.
    External { expects: TypeAlias, wake: Wake },
    /// The result of the child chain whose outermost frame is `step`.
    Child { step: Id },
    /// Completions of aggregated children.
    Children,
}

/// Who is expected to deliver an external trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Wake {
    Signal,
    Timer,
    Yield,
}

/// The persisted form of one frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FrameEnvelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub type_id: TypeAlias,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiter: Option<u32>,
    pub awaiting: Awaiting,
    pub fields: BTreeMap<String, FieldValue>,
    pub digest: String,
}

impl FrameEnvelope {
    pub(crate) fn seal(
        type_id: TypeAlias,
        awaiter: Option<u32>,
        awaiting: Awaiting,
        fields: BTreeMap<String, FieldValue>,
    ) -> FlowResult<Self> {
        let digest = digest(&type_id, awaiter, &awaiting, &fields)?;
        Ok(Self {
            version: FRAME_VERSION,
            type_id,
            awaiter,
            awaiting,
            fields,
            digest,
        })
    }

    pub(crate) fn to_bytes(&self) -> FlowResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and verify stored frame bytes.
    pub(crate) fn from_bytes(step_id: Id, bytes: &[u8]) -> FlowResult<Self> {
        let envelope: FrameEnvelope =
            serde_json::from_slice(bytes).map_err(|_| FlowError::FrameCorrupted { step_id })?;
        if envelope.version != FRAME_VERSION {
            return Err(FlowError::shape(
                &envelope.type_id,
                format!("unsupported frame version {}", envelope.version),
            ));
        }
        let expected = digest(
            &envelope.type_id,
            envelope.awaiter,
            &envelope.awaiting,
            &envelope.fields,
        )?;
        if expected != envelope.digest {
            return Err(FlowError::FrameCorrupted { step_id });
        }
        Ok(envelope)
    }
}

fn digest(
    type_id: &TypeAlias,
    awaiter: Option<u32>,
    awaiting: &Awaiting,
    fields: &BTreeMap<String, FieldValue>,
) -> FlowResult<String> {
    let canonical = serde_json::to_vec(&(type_id, awaiter, awaiting, fields))?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

fn check_field(
    type_id: &TypeAlias,
    layout: &Layout,
    name: &str,
    kind: FieldKind,
) -> FlowResult<()> {
    match layout.get(name) {
        None => Err(FlowError::shape(
            type_id,
            format!("field `{name}` is not declared"),
        )),
        Some(field) if field.kind == FieldKind::Builder => Err(FlowError::shape(
            type_id,
            format!("builder field `{name}` is never persisted"),
        )),
        Some(field) if field.kind != kind => Err(FlowError::shape(
            type_id,
            format!("field `{name}` is declared as {:?}, not {kind:?}", field.kind),
        )),
        Some(_) => Ok(()),
    }
}

/// Collects the fields of a continuation being dehydrated.
pub struct FrameWriter<'a> {
    type_id: &'a TypeAlias,
    layout: &'a Layout,
    chain: &'a SurrogateChain,
    cx: SurrogateContext<'a>,
    fields: BTreeMap<String, FieldValue>,
    awaiter: Option<u32>,
    written: HashSet<String>,
}

impl<'a> FrameWriter<'a> {
    pub(crate) fn new(
        type_id: &'a TypeAlias,
        layout: &'a Layout,
        chain: &'a SurrogateChain,
        cx: SurrogateContext<'a>,
    ) -> Self {
        Self {
            type_id,
            layout,
            chain,
            cx,
            fields: BTreeMap::new(),
            awaiter: None,
            written: HashSet::new(),
        }
    }

    pub fn resolver(&self) -> &TypeResolver {
        self.cx.resolver
    }

    /// Cached layout of the type being written.
    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    pub fn flow_id(&self) -> Id {
        self.cx.flow_id
    }

    fn claim(&mut self, name: &str, kind: FieldKind) -> FlowResult<()> {
        check_field(self.type_id, self.layout, name, kind)?;
        if !self.written.insert(name.to_string()) {
            return Err(FlowError::shape(
                self.type_id,
                format!("field `{name}` written twice"),
            ));
        }
        Ok(())
    }

    /// Write a user field, surrogating it if a surrogator claims the value.
    pub fn user<T: Serialize + Any>(&mut self, name: &str, value: &T) -> FlowResult<()> {
        self.claim(name, FieldKind::User)?;
        let stored = match self.chain.try_surrogate(value, &self.cx)? {
            Some(token) => FieldValue::Surrogate(token),
            None => FieldValue::Plain(serde_json::to_value(value)?),
        };
        self.fields.insert(name.to_string(), stored);
        Ok(())
    }

    /// Write a user field that is already plain JSON.
    pub fn json(&mut self, name: &str, value: JsonValue) -> FlowResult<()> {
        self.claim(name, FieldKind::User)?;
        self.fields.insert(name.to_string(), FieldValue::Plain(value));
        Ok(())
    }

    /// Write a user field that has no plain representation.
    pub fn surrogate<T: Any>(&mut self, name: &str, value: &T) -> FlowResult<()> {
        self.claim(name, FieldKind::User)?;
        let token = self.chain.surrogate(value, &self.cx)?;
        self.fields
            .insert(name.to_string(), FieldValue::Surrogate(token));
        Ok(())
    }

    /// Write a collection of surrogatable values as one aggregate token.
    pub fn surrogate_array<T: Any>(
        &mut self,
        name: &str,
        item_type: TypeAlias,
        items: &[T],
    ) -> FlowResult<()> {
        self.claim(name, FieldKind::User)?;
        let mut array = self.chain.begin_array(item_type, items.len(), &self.cx);
        for item in items {
            array.write_item(item)?;
        }
        let token = array.end_array()?;
        self.fields
            .insert(name.to_string(), FieldValue::Surrogate(token));
        Ok(())
    }

    /// Write the active-awaiter discriminator.
    pub fn awaiter(&mut self, name: &str, position: u32) -> FlowResult<()> {
        self.claim(name, FieldKind::Awaiter)?;
        self.awaiter = Some(position);
        Ok(())
    }

    /// Check that every persisted field was written.
    pub(crate) fn finish(self) -> FlowResult<(BTreeMap<String, FieldValue>, Option<u32>)> {
        if let Some(missing) = self
            .layout
            .persisted()
            .find(|field| !self.written.contains(field.name))
        {
            return Err(FlowError::shape(
                self.type_id,
                format!("field `{}` was not written", missing.name),
            ));
        }
        Ok((self.fields, self.awaiter))
    }
}

/// Reads the fields of a stored frame back.
pub struct FrameReader<'a> {
    type_id: &'a TypeAlias,
    layout: &'a Layout,
    chain: &'a SurrogateChain,
    cx: SurrogateContext<'a>,
    fields: &'a BTreeMap<String, FieldValue>,
    awaiter: Option<u32>,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(
        type_id: &'a TypeAlias,
        layout: &'a Layout,
        chain: &'a SurrogateChain,
        cx: SurrogateContext<'a>,
        fields: &'a BTreeMap<String, FieldValue>,
        awaiter: Option<u32>,
    ) -> Self {
        Self {
            type_id,
            layout,
            chain,
            cx,
            fields,
            awaiter,
        }
    }

    pub fn resolver(&self) -> &TypeResolver {
        self.cx.resolver
    }

    pub fn layout(&self) -> &'a Layout {
        self.layout
    }

    pub fn flow_id(&self) -> Id {
        self.cx.flow_id
    }

    fn field(&self, name: &str, kind: FieldKind) -> FlowResult<&'a FieldValue> {
        check_field(self.type_id, self.layout, name, kind)?;
        self.fields.get(name).ok_or_else(|| {
            FlowError::shape(self.type_id, format!("field `{name}` is missing"))
        })
    }

    /// Read a user field written with [`FrameWriter::user`].
    pub fn user<T: DeserializeOwned + Any>(&self, name: &str) -> FlowResult<T> {
        match self.field(name, FieldKind::User)? {
            FieldValue::Plain(value) => T::deserialize(value).map_err(|e| {
                FlowError::shape(self.type_id, format!("field `{name}`: {e}"))
            }),
            FieldValue::Surrogate(token) => self.chain.restore_as(token, &self.cx),
        }
    }

    pub fn json(&self, name: &str) -> FlowResult<JsonValue> {
        match self.field(name, FieldKind::User)? {
            FieldValue::Plain(value) => Ok(value.clone()),
            FieldValue::Surrogate(_) => Err(FlowError::shape(
                self.type_id,
                format!("field `{name}` holds a surrogate, not plain data"),
            )),
        }
    }

    pub fn surrogate<T: Any>(&self, name: &str) -> FlowResult<T> {
        match self.field(name, FieldKind::User)? {
            FieldValue::Surrogate(token) => self.chain.restore_as(token, &self.cx),
            FieldValue::Plain(_) => Err(FlowError::shape(
                self.type_id,
                format!("field `{name}` holds plain data, not a surrogate"),
            )),
        }
    }

    pub fn surrogate_array<T: Any>(&self, name: &str) -> FlowResult<Vec<T>> {
        match self.field(name, FieldKind::User)? {
            FieldValue::Surrogate(token) => self.chain.restore_array(token, &self.cx),
            FieldValue::Plain(_) => Err(FlowError::shape(
                self.type_id,
                format!("field `{name}` holds plain data, not a surrogate array"),
            )),
        }
    }

    pub fn awaiter(&self, name: &str) -> FlowResult<u32> {
        check_field(self.type_id, self.layout, name, FieldKind::Awaiter)?;
        self.awaiter.ok_or_else(|| {
            FlowError::shape(self.type_id, format!("awaiter `{name}` is missing"))
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::surrogate::{ChildRef, ChildSurrogator, ServiceScope};

    fn resolver() -> TypeResolver {
        let mut builder = TypeResolver::builder();
        builder
            .register_as::<ChildRef>(TypeAlias::new("child"))
            .unwrap();
        builder.build()
    }

    #[test]
    fn test_writer_enforces_layout() {
        let resolver = resolver();
        let services = ServiceScope::default();
        let chain = SurrogateChain::new().with(ChildSurrogator);
        let alias = TypeAlias::new("sample");
        let layout = Layout::new().awaiter("state").user("name").builder("cache");
        let cx = SurrogateContext::new(&resolver, Id::new_flow(), &services);

        let mut w = FrameWriter::new(&alias, &layout, &chain, cx);
        assert!(w.user("undeclared", &1u32).is_err());
        assert!(w.user("cache", &1u32).is_err());
        assert!(w.user("state", &1u32).is_err());
        w.user("name", &"ada".to_string()).unwrap();
        assert!(w.user("name", &"twice".to_string()).is_err());

        let incomplete = FrameWriter::new(&alias, &layout, &chain, cx);
        assert!(incomplete.finish().is_err());

        w.awaiter("state", 2).unwrap();
        let (fields, awaiter) = w.finish().unwrap();
        assert_eq!(awaiter, Some(2));
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn test_user_field_is_surrogated_when_claimed() {
        let resolver = resolver();
        let services = ServiceScope::default();
        let chain = SurrogateChain::new().with(ChildSurrogator);
        let alias = TypeAlias::new("sample");
        let layout = Layout::new().user("child").user("count");
        let flow_id = Id::new_flow();
        let cx = SurrogateContext::new(&resolver, flow_id, &services);

        let child = ChildRef::new(flow_id, Id::new_step(), None);
        let mut w = FrameWriter::new(&alias, &layout, &chain, cx);
        w.user("child", &child).unwrap();
        w.user("count", &7u64).unwrap();
        let (fields, awaiter) = w.finish().unwrap();
        assert!(matches!(fields["child"], FieldValue::Surrogate(_)));
        assert!(matches!(fields["count"], FieldValue::Plain(_)));

        let r = FrameReader::new(&alias, &layout, &chain, cx, &fields, awaiter);
        assert_eq!(r.user::<ChildRef>("child").unwrap(), child);
        assert_eq!(r.user::<u64>("count").unwrap(), 7);
        assert!(r.json("child").is_err());
        assert!(r.surrogate::<u64>("count").is_err());
    }

    #[test]
    fn test_envelope_digest_detects_tampering() {
        let step_id = Id::new_step();
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FieldValue::Plain(JsonValue::from(1)));
        let envelope = FrameEnvelope::seal(
            TypeAlias::new("sample"),
            Some(0),
            Awaiting::External {
                expects: TypeAlias::new("u64"),
                wake: Wake::Signal,
            },
            fields,
        )
        .unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let parsed = FrameEnvelope::from_bytes(step_id, &bytes).unwrap();
        assert_eq!(parsed.awaiting, envelope.awaiting);

        let tampered = String::from_utf8(bytes)
            .unwrap()
            .replace("\"plain\":1", "\"plain\":2");
        assert!(matches!(
            FrameEnvelope::from_bytes(step_id, tampered.as_bytes()),
            Err(FlowError::FrameCorrupted { .. })
        ));
        assert!(matches!(
            FrameEnvelope::from_bytes(step_id, b"not json"),
            Err(FlowError::FrameCorrupted { .. })
        ));
    }
}
