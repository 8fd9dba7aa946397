use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::{Surrogate, SurrogateContext, Surrogator};
use crate::error::{FlowResult, SurrogateError};

/// Shared handle to an injected service.
///
/// Continuations hold services through this type so that frames can store a
/// token instead of the service itself. After hydration the handle points at
/// whatever the current [`ServiceScope`] provides for `T`.
pub struct Service<T: ?Sized>(Arc<T>);

impl<T: ?Sized> Service<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self(inner)
    }

    /// Whether two handles point at the same service instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn into_inner(self) -> Arc<T> {
        self.0
    }
}

impl<T: ?Sized> Clone for Service<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> Deref for Service<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> From<Arc<T>> for Service<T> {
    fn from(inner: Arc<T>) -> Self {
        Self(inner)
    }
}

impl<T: ?Sized> fmt::Debug for Service<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service<{}>", type_name::<T>())
    }
}

/// The set of services a flow runs with, e.g. one per request or tenant.
///
/// The scope name is recorded in service tokens: a token only restores in a
/// scope of the same name.
pub struct ServiceScope {
    name: String,
    services: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Default for ServiceScope {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("name", &self.name)
            .field("services", &self.services.len())
            .finish()
    }
}

impl ServiceScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            services: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provide the service used for `T`, replacing any previous one.
    pub fn provide<T: ?Sized + Send + Sync + 'static>(&mut self, service: Arc<T>) -> &mut Self {
        self.services
            .insert(TypeId::of::<T>(), Box::new(Service::new(service)));
        self
    }

    /// Builder-style [`provide`](Self::provide).
    pub fn with<T: ?Sized + Send + Sync + 'static>(mut self, service: Arc<T>) -> Self {
        self.provide(service);
        self
    }

    /// The service provided for `T`, if any.
    pub fn get<T: ?Sized + 'static>(&self) -> Option<Service<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<Service<T>>())
            .cloned()
    }

    pub fn contains<T: ?Sized + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ServicePayload {
    scope: String,
}

struct ServiceEntry {
    interface: TypeId,
    interface_name: &'static str,
    restore: fn(&ServiceScope) -> Option<Box<dyn Any + Send>>,
}

fn restore_service<T: ?Sized + Send + Sync + 'static>(
    scope: &ServiceScope,
) -> Option<Box<dyn Any + Send>> {
    scope
        .get::<T>()
        .map(|service| Box::new(service) as Box<dyn Any + Send>)
}

/// The "scoped-service" surrogator: `Service<T>` handles become
/// `{scope}` tokens and are re-resolved from the current scope on restore.
///
/// Every service interface must be registered (here and with the type
/// resolver) before flows holding it can suspend.
#[derive(Default)]
pub struct ServiceSurrogator {
    // keyed by the TypeId of `Service<T>`
    by_handle: HashMap<TypeId, TypeId>,
    // keyed by the TypeId of `T`
    by_interface: HashMap<TypeId, ServiceEntry>,
}

impl ServiceSurrogator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `Service<T>` values.
    pub fn register<T: ?Sized + Send + Sync + 'static>(mut self) -> Self {
        self.add::<T>();
        self
    }

    pub fn add<T: ?Sized + Send + Sync + 'static>(&mut self) {
        self.by_handle
            .insert(TypeId::of::<Service<T>>(), TypeId::of::<T>());
        self.by_interface.insert(
            TypeId::of::<T>(),
            ServiceEntry {
                interface: TypeId::of::<T>(),
                interface_name: type_name::<T>(),
                restore: restore_service::<T>,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.by_interface.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_interface.is_empty()
    }
}

impl Surrogator for ServiceSurrogator {
    fn name(&self) -> &str {
        "scoped-service"
    }

    fn try_surrogate(
        &self,
        value: &dyn Any,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Surrogate>> {
        let Some(entry) = self
            .by_handle
            .get(&value.type_id())
            .and_then(|interface| self.by_interface.get(interface))
        else {
            return Ok(None);
        };
        let type_id = cx
            .resolver
            .alias_of(entry.interface, entry.interface_name)?
            .clone();
        let payload = ServicePayload {
            scope: cx.services.name().to_string(),
        };
        Ok(Some(Surrogate::new(type_id, serde_json::to_value(payload)?)))
    }

    fn try_restore(
        &self,
        token: &Surrogate,
        cx: &SurrogateContext<'_>,
    ) -> FlowResult<Option<Box<dyn Any + Send>>> {
        let Ok(registered) = cx.resolver.type_of(&token.type_id) else {
            return Ok(None);
        };
        let Some(entry) = self.by_interface.get(&registered.rust_type) else {
            return Ok(None);
        };
        let payload: ServicePayload = serde_json::from_value(token.payload.clone()).map_err(|e| {
            SurrogateError::Shape {
                type_id: token.type_id.clone(),
                reason: e.to_string(),
            }
        })?;
        if payload.scope != cx.services.name() {
            return Err(SurrogateError::ScopeMismatch {
                captured: payload.scope,
                current: cx.services.name().to_string(),
            }
            .into());
        }
        let service = (entry.restore)(cx.services).ok_or_else(|| SurrogateError::MissingService {
            scope: cx.services.name().to_string(),
            type_id: token.type_id.clone(),
        })?;
        Ok(Some(service))
    }
}
