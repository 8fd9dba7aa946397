//! Stable, serializable aliases for Rust types.
//!
//! Frames and surrogate tokens never store Rust type names directly: those
//! change with module moves and compiler versions. Instead every type that
//! crosses the persistence boundary is registered under a short [`TypeAlias`]
//! in one [`TypeResolver`], configured once at startup. The mapping is a
//! bijection; looking up an unknown alias or an unregistered type is an error.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;

use crate::error::{FlowError, FlowResult};

const MAX_ALIAS_LEN: usize = 128;

/// Short, stable name standing in for a Rust type in persisted data.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeAlias(String);

impl TypeAlias {
    /// Build an alias from an explicit constant.
    ///
    /// # Panics
    ///
    /// Panics if `alias` is empty, longer than 128 bytes, or contains
    /// whitespace. Aliases are program constants, so this is a programming
    /// error rather than a runtime condition. Use [`TypeAlias::try_new`] for
    /// untrusted input.
    pub fn new(alias: impl Into<String>) -> Self {
        match Self::try_new(alias) {
            Ok(alias) => alias,
            Err(e) => panic!("{e}"),
        }
    }

    /// Build an alias, validating it.
    pub fn try_new(alias: impl Into<String>) -> FlowResult<Self> {
        let alias = alias.into();
        if alias.is_empty() || alias.len() > MAX_ALIAS_LEN {
            return Err(FlowError::InvalidConfiguration {
                reason: format!("type alias must be 1..={MAX_ALIAS_LEN} bytes: `{alias}`"),
            });
        }
        if alias.chars().any(char::is_whitespace) {
            return Err(FlowError::InvalidConfiguration {
                reason: format!("type alias must not contain whitespace: `{alias}`"),
            });
        }
        Ok(Self(alias))
    }

    /// Build an alias from structured name parts, e.g. `["billing", "Receipt"]`
    /// becomes `billing.Receipt`.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> FlowResult<Self> {
        let joined = parts
            .iter()
            .map(|p| p.as_ref().trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        Self::try_new(joined)
    }

    /// Derive an alias from the Rust type name with module paths stripped:
    /// `alloc::vec::Vec<app::Receipt>` becomes `Vec<Receipt>`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        let short = shorten_type_name(type_name::<T>());
        Self(short.replace(' ', "_"))
    }

    /// Alias used for an array of surrogates of this type.
    pub fn array_of(&self) -> Self {
        Self(format!("[{}]", self.0))
    }

    /// For an array alias, the element alias.
    pub fn element(&self) -> Option<Self> {
        self.0
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .map(|inner| Self(inner.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TypeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeAlias({})", self.0)
    }
}

/// Strip module paths from every path segment of a type name.
fn shorten_type_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut token = String::new();
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_alphanumeric() || c == '_' {
            token.push(c);
        } else if c == ':' && chars.peek() == Some(&':') {
            chars.next();
            token.clear();
        } else {
            out.push_str(&token);
            token.clear();
            out.push(c);
        }
    }
    out.push_str(&token);
    out
}

/// A registered type.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub alias: TypeAlias,
    pub type_name: &'static str,
    pub rust_type: TypeId,
}

/// Bijective mapping between Rust types and [`TypeAlias`]es.
///
/// Built once with [`TypeResolverBuilder`] and shared read-only by the
/// inspection and surrogation layers.
#[derive(Debug, Clone)]
pub struct TypeResolver {
    by_type: HashMap<TypeId, TypeAlias>,
    by_alias: HashMap<TypeAlias, TypeEntry>,
}

impl TypeResolver {
    pub fn builder() -> TypeResolverBuilder {
        TypeResolverBuilder::new()
    }

    /// Alias of a registered type.
    pub fn type_id<T: ?Sized + 'static>(&self) -> FlowResult<&TypeAlias> {
        self.alias_of(TypeId::of::<T>(), type_name::<T>())
    }

    /// Alias of a registered type, by its runtime identity.
    pub fn alias_of(&self, rust_type: TypeId, type_name: &str) -> FlowResult<&TypeAlias> {
        self.by_type
            .get(&rust_type)
            .ok_or_else(|| FlowError::UnregisteredType {
                type_name: type_name.to_string(),
            })
    }

    /// The type registered under an alias.
    pub fn type_of(&self, alias: &TypeAlias) -> FlowResult<&TypeEntry> {
        self.by_alias
            .get(alias)
            .ok_or_else(|| FlowError::UnknownTypeAlias {
                type_id: alias.clone(),
            })
    }

    /// Whether `alias` names `T`.
    pub fn is<T: ?Sized + 'static>(&self, alias: &TypeAlias) -> bool {
        self.by_alias
            .get(alias)
            .is_some_and(|entry| entry.rust_type == TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}

/// Builder for a [`TypeResolver`].
///
/// Primitive types and `serde_json::Value` are pre-registered under their
/// Rust names (`()`, `bool`, `i64`, `String`, ...).
#[derive(Debug)]
pub struct TypeResolverBuilder {
    resolver: TypeResolver,
}

impl Default for TypeResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeResolverBuilder {
    pub fn new() -> Self {
        let mut builder = Self::empty();
        for (rust_type, name, alias) in primitive_entries() {
            // Primitive aliases are distinct constants, so this cannot collide.
            let _ = builder.insert(rust_type, name, TypeAlias(alias.to_string()));
        }
        builder
    }

    /// A builder without the pre-registered primitives.
    pub fn empty() -> Self {
        Self {
            resolver: TypeResolver {
                by_type: HashMap::new(),
                by_alias: HashMap::new(),
            },
        }
    }

    /// Register `T` under an alias derived from its type name.
    pub fn register<T: ?Sized + 'static>(&mut self) -> FlowResult<TypeAlias> {
        self.register_as::<T>(TypeAlias::of::<T>())
    }

    /// Register `T` under an explicit alias.
    pub fn register_as<T: ?Sized + 'static>(&mut self, alias: TypeAlias) -> FlowResult<TypeAlias> {
        self.insert(TypeId::of::<T>(), type_name::<T>(), alias)
    }

    /// Whether `T` is already registered.
    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.resolver.by_type.contains_key(&TypeId::of::<T>())
    }

    fn insert(
        &mut self,
        rust_type: TypeId,
        type_name: &'static str,
        alias: TypeAlias,
    ) -> FlowResult<TypeAlias> {
        if let Some(existing) = self.resolver.by_type.get(&rust_type) {
            return Err(FlowError::DuplicateType {
                reason: format!("`{type_name}` is already registered as `{existing}`"),
            });
        }
        if let Some(existing) = self.resolver.by_alias.get(&alias) {
            return Err(FlowError::DuplicateType {
                reason: format!(
                    "alias `{alias}` is already used by `{}`",
                    existing.type_name
                ),
            });
        }
        self.resolver.by_type.insert(rust_type, alias.clone());
        self.resolver.by_alias.insert(
            alias.clone(),
            TypeEntry {
                alias: alias.clone(),
                type_name,
                rust_type,
            },
        );
        Ok(alias)
    }

    pub fn build(self) -> TypeResolver {
        self.resolver
    }
}

fn primitive_entries() -> Vec<(TypeId, &'static str, &'static str)> {
    macro_rules! entry {
        ($ty:ty, $alias:expr) => {
            (TypeId::of::<$ty>(), type_name::<$ty>(), $alias)
        };
    }
    vec![
        entry!((), "()"),
        entry!(bool, "bool"),
        entry!(i32, "i32"),
        entry!(i64, "i64"),
        entry!(u32, "u32"),
        entry!(u64, "u64"),
        entry!(usize, "usize"),
        entry!(f64, "f64"),
        entry!(String, "String"),
        entry!(JsonValue, "json"),
    ]
}
