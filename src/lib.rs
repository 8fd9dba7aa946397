mod config;
mod context;
mod drive;
mod engine;
mod error;
mod frames;
mod host;
mod id;
mod inspect;
mod resolver;
mod store;
mod surrogate;
mod task;
mod types;
mod worker;

#[cfg(feature = "telemetry")]
pub mod telemetry;

// Re-export public API
pub use config::{FlowConfig, FlowConfigBuilder};
pub use context::StepContext;
pub use engine::{FlowEngine, FlowEngineBuilder};
pub use error::{FlowError, FlowResult, SurrogateError, TaskError, TaskFailure, TaskResult};
pub use host::{FlowHost, NoopHost};
pub use id::{ID_BYTES, ID_TEXT_LEN, Id};
pub use inspect::{
    Descriptor, DescriptorRegistry, FieldKind, FieldSpec, FieldValue, FrameReader, FrameWriter,
    Inspect, Layout, Reflective,
};
pub use resolver::{TypeAlias, TypeEntry, TypeResolver, TypeResolverBuilder};
pub use store::{HeapStore, MemoryHeapStore, MemoryStackStore, ParentLink, StackStore, StoredFrame, keys};
pub use surrogate::{
    ChildRef, ChildSurrogator, Service, ServiceScope, ServiceSurrogator, Surrogate,
    SurrogateArray, SurrogateChain, SurrogateContext, Surrogator,
};
pub use task::{
    Awaited, Continuation, Resumption, Signal, Step, SuspendCallback, SuspendPoint, Task,
    when_all, when_any,
};
pub use types::{
    Finished, FlowRecord, FlowStatus, Outcome, Reminder, ReminderOptions, ResumeOutcome,
    TaskStatus,
};
pub use worker::ReminderWorker;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
