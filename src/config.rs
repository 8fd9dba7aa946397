use std::sync::Arc;

use crate::error::{FlowError, FlowResult};
use crate::frames::{
    AllFrame, AnyFrame, BuiltinFrames, CHILD_ALIAS, LEAF_ALIAS, LeafFrame, WHEN_ALL_ALIAS,
    WHEN_ANY_ALIAS,
};
use crate::inspect::{DescriptorRegistry, Inspect};
use crate::resolver::{TypeAlias, TypeResolver, TypeResolverBuilder};
use crate::surrogate::{ChildRef, ChildSurrogator, ServiceSurrogator, SurrogateChain, Surrogator};
use crate::task::Continuation;

type RegisterFn = fn(&mut DescriptorRegistry, &TypeResolver) -> FlowResult<()>;

fn register_descriptor<C>(registry: &mut DescriptorRegistry, resolver: &TypeResolver) -> FlowResult<()>
where
    C: Continuation + Inspect,
{
    registry.insert::<C>(resolver)
}

/// Everything the engine needs to know about the types flowing through it:
/// the type resolver, the cached continuation descriptors and the surrogate
/// chain.
///
/// Built once at startup with [`FlowConfig::builder`] and shared by every
/// engine call. Registration is append-only: after `build()` nothing changes.
#[derive(Debug)]
pub struct FlowConfig {
    resolver: TypeResolver,
    descriptors: DescriptorRegistry,
    surrogates: SurrogateChain,
    pub(crate) frames: BuiltinFrames,
}

impl FlowConfig {
    pub fn builder() -> FlowConfigBuilder {
        FlowConfigBuilder::new()
    }

    pub fn resolver(&self) -> &TypeResolver {
        &self.resolver
    }

    pub fn descriptors(&self) -> &DescriptorRegistry {
        &self.descriptors
    }

    pub fn surrogates(&self) -> &SurrogateChain {
        &self.surrogates
    }
}

/// Builder for [`FlowConfig`].
///
/// Registration errors (duplicate types or aliases, malformed aliases,
/// invalid layouts) are collected and reported by [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// let config = FlowConfig::builder()
///     .register::<Receipt>()
///     .continuation::<Checkout>()
///     .service::<dyn PaymentGateway>()
///     .build()?;
/// ```
pub struct FlowConfigBuilder {
    types: TypeResolverBuilder,
    continuations: Vec<RegisterFn>,
    services: ServiceSurrogator,
    custom: Vec<Arc<dyn Surrogator>>,
    errors: Vec<FlowError>,
}

impl Default for FlowConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowConfigBuilder {
    pub fn new() -> Self {
        Self {
            types: TypeResolverBuilder::new(),
            continuations: Vec::new(),
            services: ServiceSurrogator::new(),
            custom: Vec::new(),
            errors: Vec::new(),
        }
        .register_as::<ChildRef>(CHILD_ALIAS)
        .register_as::<LeafFrame>(LEAF_ALIAS)
        .register_as::<AllFrame>(WHEN_ALL_ALIAS)
        .register_as::<AnyFrame>(WHEN_ANY_ALIAS)
    }

    fn record<T>(&mut self, result: FlowResult<T>) {
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    /// Register a data type under an alias derived from its name.
    pub fn register<T: ?Sized + 'static>(mut self) -> Self {
        let result = self.types.register::<T>();
        self.record(result);
        self
    }

    /// Register a data type under an explicit alias.
    pub fn register_as<T: ?Sized + 'static>(mut self, alias: &str) -> Self {
        let result = TypeAlias::try_new(alias).and_then(|alias| self.types.register_as::<T>(alias));
        self.record(result);
        self
    }

    /// Register a continuation type so its frames can be written and read.
    pub fn continuation<C: Continuation + Inspect>(mut self) -> Self {
        self = self.register::<C>();
        self.continuations.push(register_descriptor::<C>);
        self
    }

    pub fn continuation_as<C: Continuation + Inspect>(mut self, alias: &str) -> Self {
        self = self.register_as::<C>(alias);
        self.continuations.push(register_descriptor::<C>);
        self
    }

    /// Allow `Service<T>` handles in continuation fields.
    pub fn service<T: ?Sized + Send + Sync + 'static>(mut self) -> Self {
        self.services.add::<T>();
        self.register::<T>()
    }

    pub fn service_as<T: ?Sized + Send + Sync + 'static>(mut self, alias: &str) -> Self {
        self.services.add::<T>();
        self.register_as::<T>(alias)
    }

    /// Append a surrogator. Custom surrogators are consulted after the
    /// built-in child and service surrogators, in registration order.
    pub fn surrogator(mut self, surrogator: impl Surrogator + 'static) -> Self {
        self.custom.push(Arc::new(surrogator));
        self
    }

    pub fn build(mut self) -> FlowResult<FlowConfig> {
        if !self.errors.is_empty() {
            let reason = self
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(match self.errors.len() {
                1 => self.errors.remove(0),
                _ => FlowError::InvalidConfiguration { reason },
            });
        }

        let resolver = self.types.build();
        let mut descriptors = DescriptorRegistry::default();
        for register in &self.continuations {
            register(&mut descriptors, &resolver)?;
        }

        let mut surrogates = SurrogateChain::new()
            .with(ChildSurrogator)
            .with(self.services);
        for custom in self.custom {
            surrogates.push(custom);
        }

        tracing::debug!(
            types = resolver.len(),
            continuations = descriptors.len(),
            surrogators = ?surrogates.names(),
            "Built flow configuration"
        );

        Ok(FlowConfig {
            resolver,
            descriptors,
            surrogates,
            frames: BuiltinFrames::new()?,
        })
    }
}
