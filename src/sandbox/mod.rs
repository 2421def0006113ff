//! Sandbox orchestration
//!
//! One isolated, resource-capped container run per request:
//!
//! ```text
//! ExecutionRequest → semaphore slot → workspace files → container
//!        │                                                 │
//!        │                                      wait (wall-clock limit)
//!        │                                                 │
//!        └── ExecutionRecord ◄── truncate ◄── sentinel ◄── logs
//! ```
//!
//! - `stop_type` - the `ExecStopType` sum type and the sentinel protocol
//! - `workspace` - per-session working directories and delivered artifacts
//! - `orchestrator` - the bounded execute path
//! - `reaper` - per-session idle cleanup timers

pub mod orchestrator;
pub mod reaper;
pub mod stop_type;
pub mod workspace;

pub use orchestrator::{SandboxError, SandboxOrchestrator, SandboxRun};
pub use reaper::IdleReaper;
pub use stop_type::{strip_sentinel, truncate_output, ExecStopType};
pub use workspace::SandboxWorkspace;
