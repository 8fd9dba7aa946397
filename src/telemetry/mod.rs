//! Observability helpers for the flow engine.
//!
//! This module provides:
//! - Metric recording helpers (backend-agnostic via the `metrics` crate)
//! - W3C Trace Context propagation from the call that started a flow to
//!   every later resume of it
//! - A [`TelemetryBuilder`] installing an OTLP tracer, a Prometheus
//!   endpoint and a `tracing` subscriber
//!
//! # Feature Flag
//!
//! Enable with the `telemetry` feature:
//! ```toml
//! hibernate = { version = "0.1", features = ["telemetry"] }
//! ```
//!
//! Without [`TelemetryBuilder`], the library emits metrics and spans into
//! whatever recorder and subscriber the application installed.

mod config;
mod metrics;
mod propagation;

pub use config::{TelemetryBuilder, TelemetryError, TelemetryHandle};
pub use metrics::*;
pub use propagation::{extract_trace_context, inject_trace_context};
