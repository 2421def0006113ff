//! Prometheus metrics for observability
//!
//! All metrics live in the default registry and are exported via
//! [`encode_metrics`]. Label cardinality is kept low: stop types, model group
//! names and turn outcomes only.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Sandbox runs by terminal stop type
    pub static ref SANDBOX_EXECUTIONS: IntCounterVec = register_int_counter_vec!(
        "sandbot_sandbox_executions_total",
        "Sandbox runs by terminal stop type",
        &["stop_type"]
    )
    .unwrap();

    /// Wall-clock duration of one sandbox run (container create to teardown)
    pub static ref SANDBOX_EXEC_DURATION: Histogram = register_histogram!(
        "sandbot_sandbox_execution_seconds",
        "Wall-clock duration of one sandbox run",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();

    /// Time spent blocked on the global concurrency semaphore
    pub static ref SANDBOX_SLOT_WAIT: Histogram = register_histogram!(
        "sandbot_sandbox_slot_wait_seconds",
        "Time spent waiting for a sandbox slot",
        vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .unwrap();

    /// Containers currently executing
    pub static ref SANDBOX_ACTIVE: IntGauge = register_int_gauge!(
        "sandbot_sandbox_active",
        "Containers currently executing"
    )
    .unwrap();

    /// Conversation turns by outcome (completed / budget_exhausted / model_failed)
    pub static ref AGENT_TURNS: IntCounterVec = register_int_counter_vec!(
        "sandbot_agent_turns_total",
        "Conversation turns by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Iterations consumed per conversation turn
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "sandbot_agent_iterations",
        "Iterations consumed per conversation turn",
        vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0]
    )
    .unwrap();

    /// Model calls by group and outcome (ok / retryable / fatal)
    pub static ref MODEL_CALLS: IntCounterVec = register_int_counter_vec!(
        "sandbot_model_calls_total",
        "Model calls by group and outcome",
        &["group", "outcome"]
    )
    .unwrap();

    /// Model call latency by group
    pub static ref MODEL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "sandbot_model_call_seconds",
        "Model call latency by group",
        &["group"],
        vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    /// Inbound messages coalesced away by the debounce window
    pub static ref SCHEDULER_COALESCED: IntCounter = register_int_counter!(
        "sandbot_scheduler_coalesced_total",
        "Inbound messages superseded before their debounce fired"
    )
    .unwrap();

    /// Sessions reaped after the idle window
    pub static ref SESSIONS_REAPED: IntCounter = register_int_counter!(
        "sandbot_sessions_reaped_total",
        "Sessions whose workspace was reclaimed by the idle reaper"
    )
    .unwrap();
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&prometheus::gather())
}
