use chrono::{DateTime, Utc};
use std::any::type_name;

use crate::error::{TaskError, TaskResult};
use crate::id::Id;
use crate::resolver::TypeResolver;
use crate::surrogate::{Service, ServiceScope};

/// Context handed to [`Continuation::resume`](crate::Continuation::resume).
///
/// Gives a continuation access to the identity of its flow, the injected
/// services and the cancellation state, without exposing the engine itself.
/// A context only lives for one synchronous step: continuations must copy
/// what they need into their own fields.
///
/// # Example
///
/// ```ignore
/// fn resume(&mut self, cx: &mut StepContext<'_>, input: Resumption) -> TaskResult<Step<String>> {
///     cx.check_cancelled()?;
///     let mailer = cx.service::<dyn Mailer>()?;
///     mailer.send(&self.to, &format!("flow {} started", cx.flow_id()));
///     Ok(Step::Done("sent".to_string()))
/// }
/// ```
pub struct StepContext<'a> {
    flow_id: Id,
    step_id: Option<Id>,
    now: DateTime<Utc>,
    resolver: &'a TypeResolver,
    services: &'a ServiceScope,
    cancel_requested: bool,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        flow_id: Id,
        step_id: Option<Id>,
        now: DateTime<Utc>,
        resolver: &'a TypeResolver,
        services: &'a ServiceScope,
        cancel_requested: bool,
    ) -> Self {
        Self {
            flow_id,
            step_id,
            now,
            resolver,
            services,
            cancel_requested,
        }
    }

    /// The flow this step belongs to. Stable for the flow's whole life, so it
    /// can serve as an idempotency key for external calls.
    pub fn flow_id(&self) -> Id {
        self.flow_id
    }

    /// The step being resumed, or `None` on the first run of a computation.
    pub fn step_id(&self) -> Option<Id> {
        self.step_id
    }

    /// Wall-clock time at the start of this drive.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn resolver(&self) -> &TypeResolver {
        self.resolver
    }

    pub fn services(&self) -> &ServiceScope {
        self.services
    }

    /// The service provided for `T`.
    ///
    /// Hold the returned handle in a continuation field to keep it across
    /// suspensions; it is stored as a token and re-resolved on resume.
    pub fn service<T: ?Sized + 'static>(&self) -> TaskResult<Service<T>> {
        self.services.get::<T>().ok_or_else(|| {
            TaskError::Failed(anyhow::anyhow!(
                "scope `{}` does not provide `{}`",
                self.services.name(),
                type_name::<T>()
            ))
        })
    }

    /// Whether cancellation of this flow was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Return `Err(TaskError::Cancelled)` if cancellation was requested.
    pub fn check_cancelled(&self) -> TaskResult<()> {
        if self.cancel_requested {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}
