//! Metrics definitions and recording helpers for the flow engine.
//!
//! All metrics are prefixed with `hibernate_` and use Prometheus naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// Metric name constants
pub const FLOWS_STARTED_TOTAL: &str = "hibernate_flows_started_total";
pub const FLOWS_COMPLETED_TOTAL: &str = "hibernate_flows_completed_total";
pub const STEPS_RESUMED_TOTAL: &str = "hibernate_steps_resumed_total";
pub const STALE_TRIGGERS_TOTAL: &str = "hibernate_stale_triggers_total";
pub const FRAMES_WRITTEN_TOTAL: &str = "hibernate_frames_written_total";

pub const REMINDERS_IN_FLIGHT: &str = "hibernate_reminders_in_flight";
pub const REMINDER_WORKER_ACTIVE: &str = "hibernate_reminder_worker_active";

pub const RESUME_DURATION: &str = "hibernate_resume_duration_seconds";
pub const COMMIT_DURATION: &str = "hibernate_commit_duration_seconds";

/// Register all metric descriptions. Called once during telemetry initialization.
pub fn register_metrics() {
    // Counters
    describe_counter!(FLOWS_STARTED_TOTAL, "Total number of flows started");
    describe_counter!(
        FLOWS_COMPLETED_TOTAL,
        "Total number of flows that reached a terminal state"
    );
    describe_counter!(
        STEPS_RESUMED_TOTAL,
        "Total number of suspended steps resumed"
    );
    describe_counter!(
        STALE_TRIGGERS_TOTAL,
        "Total number of triggers delivered to already consumed steps"
    );
    describe_counter!(FRAMES_WRITTEN_TOTAL, "Total number of frames persisted");

    // Gauges
    describe_gauge!(
        REMINDERS_IN_FLIGHT,
        "Number of reminders currently being delivered by this worker"
    );
    describe_gauge!(
        REMINDER_WORKER_ACTIVE,
        "Whether the reminder worker is active (1) or shut down (0)"
    );

    // Histograms
    describe_histogram!(
        RESUME_DURATION,
        "Duration of a start or resume call in seconds"
    );
    describe_histogram!(
        COMMIT_DURATION,
        "Duration of frame persistence in seconds"
    );
}

// Helper functions for recording metrics

/// Record a flow start
pub fn record_flow_started() {
    counter!(FLOWS_STARTED_TOTAL).increment(1);
}

/// Record a flow reaching `succeeded`, `faulted` or `canceled`
pub fn record_flow_completed(outcome: &str) {
    counter!(FLOWS_COMPLETED_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record a resume and what it led to
pub fn record_step_resumed(result: &str) {
    counter!(STEPS_RESUMED_TOTAL, "result" => result.to_string()).increment(1);
}

/// Record a duplicate or late trigger
pub fn record_stale_trigger() {
    counter!(STALE_TRIGGERS_TOTAL).increment(1);
}

/// Record persisted frames by frame type
pub fn record_frame_written(frame_type: &str) {
    counter!(FRAMES_WRITTEN_TOTAL, "frame_type" => frame_type.to_string()).increment(1);
}

/// Set the current number of reminders being delivered by a worker
pub fn set_reminders_in_flight(worker_id: &str, count: usize) {
    gauge!(REMINDERS_IN_FLIGHT, "worker_id" => worker_id.to_string()).set(count as f64);
}

/// Set whether a reminder worker is active
pub fn set_reminder_worker_active(worker_id: &str, active: bool) {
    gauge!(REMINDER_WORKER_ACTIVE, "worker_id" => worker_id.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

/// Record the duration of a start or resume call
pub fn record_resume_duration(operation: &str, result: &str, duration_secs: f64) {
    histogram!(RESUME_DURATION, "operation" => operation.to_string(), "result" => result.to_string())
        .record(duration_secs);
}

/// Record frame persistence duration
pub fn record_commit_duration(frames: usize, duration_secs: f64) {
    histogram!(COMMIT_DURATION, "frames" => frames.to_string()).record(duration_secs);
}
