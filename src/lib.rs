//! Sandbot - chat-driven agent core with Docker-sandboxed code execution
//!
//! This library implements the three tightly coupled pieces at the heart of a
//! chat agent platform: a debounced per-session scheduler, an LLM iteration
//! engine, and a sandbox orchestrator that runs model-generated code inside
//! resource-capped Docker containers.
//!
//! # Modules
//!
//! - `agent` - iteration engine, prompt assembly, reply parsing, scheduler
//! - `docker` - Docker Engine API adapter over the Unix socket
//! - `sandbox` - sandbox orchestration, stop-type protocol, idle reaper
//! - `model` - model request client (OpenAI-compatible) with group fallback
//! - `records` - append-only execution record store
//! - `metrics` - Prometheus metrics for observability
//! - `config` - environment-driven configuration surface
//! - `tracing` - subscriber setup (console, optional OTLP export)
//!
//! # Data flow
//!
//! ```text
//! notify() → SessionScheduler → AgentEngine → SandboxOrchestrator → DockerClient
//!                 (debounce)      (LLM loop)     (one container/run)
//! ```

pub mod agent;
pub mod config;
pub mod docker;
pub mod metrics;
pub mod model;
pub mod records;
pub mod sandbox;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentEngine, SessionScheduler};
pub use config::CoreConfig;
pub use sandbox::{ExecStopType, SandboxOrchestrator};
