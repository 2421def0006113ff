//! Agent loop and session scheduling
//!
//! The pieces that turn inbound chat messages into sandbox runs:
//!
//! ```text
//! Notify(session, message) → SessionScheduler (debounce, coalesce)
//!                  ↓
//!           AgentEngine.run_turn
//!                  ↓
//!      build prompt → call model → parse reply
//!                  ↓
//!       SandboxOrchestrator.execute (container)
//!                  ↓
//!      stop type → done, or feed output back and loop
//! ```

mod engine;
mod history;
mod parser;
mod prompt;
mod scheduler;

pub use engine::{AgentEngine, AgentError, TurnOutcome};
pub use history::{HistoryBounds, InboundMessage, SessionHistory};
pub use parser::{parse_model_reply, parse_multimodal_output, ParsedReply};
pub use scheduler::SessionScheduler;
