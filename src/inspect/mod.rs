//! Dehydration and hydration of paused continuations.
//!
//! Every suspendable computation is an explicit record: named fields plus a
//! positional discriminator saying which suspension point is active. The
//! [`Inspect`] trait is the descriptor contract over that record:
//!
//! - [`Inspect::layout`] classifies each field once per type (user, awaiter,
//!   or driving-builder field).
//! - [`Inspect::dehydrate`] writes every live field into a [`FrameWriter`].
//! - [`Inspect::hydrate`] rebuilds an instance from a [`FrameReader`].
//!
//! Three strategies produce implementations of the same contract: hand-written
//! impls, the compile-time [`inspect!`](crate::inspect!) macro, and the
//! reflective [`Reflective`] fallback for plain-data serde types. Whichever is
//! used, the layout is computed once at configuration time and cached in a
//! [`DescriptorRegistry`]; no per-call inspection happens afterwards.

mod macros;
mod reflect;
mod writer;

pub use reflect::Reflective;
pub use writer::{FieldValue, FrameReader, FrameWriter};

pub(crate) use writer::{Awaiting, FrameEnvelope, Wake};

use std::any::{TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{FlowError, FlowResult};
use crate::resolver::{TypeAlias, TypeResolver};
use crate::task::{Continuation, ErasedContinuation};

/// Role of a field in a continuation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Ordinary captured value; stored as plain data or as a surrogate token.
    User,
    /// Positional discriminator of the active suspension point.
    Awaiter,
    /// Driving state that is never persisted and is rebuilt on hydration.
    Builder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Field layout of one continuation type.
///
/// Field names are part of the persisted format: renaming a field makes
/// frames written before the rename unreadable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<FieldSpec>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec { name, kind });
        self
    }

    pub fn user(self, name: &'static str) -> Self {
        self.field(name, FieldKind::User)
    }

    pub fn awaiter(self, name: &'static str) -> Self {
        self.field(name, FieldKind::Awaiter)
    }

    pub fn builder(self, name: &'static str) -> Self {
        self.field(name, FieldKind::Builder)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The awaiter field, if the type has more than one suspension point.
    pub fn awaiter_field(&self) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|f| f.kind == FieldKind::Awaiter)
            .map(|f| f.name)
    }

    /// Fields that are written to frames (user and awaiter fields).
    pub fn persisted(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.kind != FieldKind::Builder)
    }

    /// Check that names are unique and that at most one awaiter exists.
    pub fn validate(&self, type_id: &TypeAlias) -> FlowResult<()> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(FlowError::shape(type_id, "empty field name"));
            }
            if !seen.insert(field.name) {
                return Err(FlowError::shape(
                    type_id,
                    format!("field `{}` is declared twice", field.name),
                ));
            }
        }
        let awaiters = self
            .fields
            .iter()
            .filter(|f| f.kind == FieldKind::Awaiter)
            .count();
        if awaiters > 1 {
            return Err(FlowError::shape(
                type_id,
                format!("{awaiters} awaiter fields declared, at most one allowed"),
            ));
        }
        Ok(())
    }
}

/// Descriptor contract for suspendable records.
///
/// # Example
///
/// ```ignore
/// struct Greeting {
///     state: u32,
///     name: String,
///     mailer: Service<dyn Mailer>,
/// }
///
/// impl Inspect for Greeting {
///     fn layout() -> FlowResult<Layout> {
///         Ok(Layout::new().awaiter("state").user("name").user("mailer"))
///     }
///
///     fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()> {
///         w.awaiter("state", self.state)?;
///         w.user("name", &self.name)?;
///         w.surrogate("mailer", &self.mailer)
///     }
///
///     fn hydrate(r: &FrameReader<'_>) -> FlowResult<Self> {
///         Ok(Self {
///             state: r.awaiter("state")?,
///             name: r.user("name")?,
///             mailer: r.surrogate("mailer")?,
///         })
///     }
/// }
/// ```
pub trait Inspect: Sized {
    /// Classify the fields of this type. Called once, at registration.
    fn layout() -> FlowResult<Layout>;

    /// Write every live user and awaiter field.
    fn dehydrate(&self, w: &mut FrameWriter<'_>) -> FlowResult<()>;

    /// Rebuild an instance; builder fields are recreated, not read.
    fn hydrate(r: &FrameReader<'_>) -> FlowResult<Self>;
}

type HydrateFn = fn(&FrameReader<'_>) -> FlowResult<Box<dyn ErasedContinuation>>;

fn hydrate_erased<C>(r: &FrameReader<'_>) -> FlowResult<Box<dyn ErasedContinuation>>
where
    C: Continuation + Inspect,
{
    Ok(Box::new(C::hydrate(r)?))
}

/// Cached, type-erased descriptor of one continuation type.
pub struct Descriptor {
    alias: TypeAlias,
    type_name: &'static str,
    layout: Layout,
    hydrate: HydrateFn,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("alias", &self.alias)
            .field("type_name", &self.type_name)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Descriptor {
    pub fn alias(&self) -> &TypeAlias {
        &self.alias
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn hydrate(&self, r: &FrameReader<'_>) -> FlowResult<Box<dyn ErasedContinuation>> {
        (self.hydrate)(r)
    }
}

/// One descriptor per registered continuation type, addressable by alias and
/// by Rust type.
#[derive(Debug, Default, Clone)]
pub struct DescriptorRegistry {
    by_alias: HashMap<TypeAlias, Arc<Descriptor>>,
    by_type: HashMap<TypeId, Arc<Descriptor>>,
}

impl DescriptorRegistry {
    /// Inspect `C` and cache its descriptor. `C` must already be registered
    /// with `resolver`.
    pub(crate) fn insert<C>(&mut self, resolver: &TypeResolver) -> FlowResult<()>
    where
        C: Continuation + Inspect,
    {
        let alias = resolver.type_id::<C>()?.clone();
        let layout = C::layout()?;
        layout.validate(&alias)?;
        let descriptor = Arc::new(Descriptor {
            alias: alias.clone(),
            type_name: type_name::<C>(),
            layout,
            hydrate: hydrate_erased::<C>,
        });
        self.by_alias.insert(alias, Arc::clone(&descriptor));
        self.by_type.insert(TypeId::of::<C>(), descriptor);
        Ok(())
    }

    pub fn get(&self, alias: &TypeAlias) -> FlowResult<&Descriptor> {
        self.by_alias
            .get(alias)
            .map(Arc::as_ref)
            .ok_or_else(|| FlowError::UnknownTypeAlias {
                type_id: alias.clone(),
            })
    }

    pub fn for_type(&self, rust_type: TypeId, type_name: &str) -> FlowResult<&Descriptor> {
        self.by_type
            .get(&rust_type)
            .map(Arc::as_ref)
            .ok_or_else(|| FlowError::UnregisteredType {
                type_name: type_name.to_string(),
            })
    }

    pub fn contains(&self, alias: &TypeAlias) -> bool {
        self.by_alias.contains_key(alias)
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}
