//! Debounced session scheduler
//!
//! Inbound messages rarely arrive alone; people send three lines in four
//! seconds. Each notification resets a per-session debounce deadline, and
//! only the waiter whose deadline survives untouched starts a turn. At most
//! one turn per session runs at a time; messages arriving mid-run are picked
//! up by the completion check, not by a new waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info};

use crate::agent::engine::AgentEngine;
use crate::agent::history::InboundMessage;
use crate::metrics::SCHEDULER_COALESCED;

struct SessionState {
    running: bool,
    pending: Option<InboundMessage>,
    deadline: Instant,
    /// Bumped on every notify; a waiter only acts if its captured
    /// generation is still current
    generation: u64,
}

/// Entry point for inbound chat events.
pub struct SessionScheduler {
    engine: Arc<AgentEngine>,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
    debounce: Duration,
    accepting: AtomicBool,
}

impl SessionScheduler {
    pub fn new(engine: Arc<AgentEngine>, debounce: Duration) -> Self {
        Self {
            engine,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            debounce,
            accepting: AtomicBool::new(true),
        }
    }

    /// Record an inbound message and (re)arm the session's debounce.
    ///
    /// Safe to call concurrently and rapidly; a burst within the debounce
    /// window coalesces into one turn triggered by the burst's last message.
    pub fn notify(&self, session_key: &str, message: InboundMessage) {
        if !self.accepting.load(Ordering::SeqCst) {
            info!(session = %session_key, "shutting down, message dropped");
            return;
        }
        self.engine.history().record(session_key, message.clone());

        let deadline = Instant::now() + self.debounce;
        let generation;
        let spawn_waiter;
        {
            let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
            let state = sessions.entry(session_key.to_string()).or_insert(SessionState {
                running: false,
                pending: None,
                deadline,
                generation: 0,
            });
            if state.pending.is_some() {
                SCHEDULER_COALESCED.inc();
            }
            state.pending = Some(message);
            state.deadline = deadline;
            state.generation += 1;
            generation = state.generation;
            spawn_waiter = !state.running;
        }

        if spawn_waiter {
            let engine = Arc::clone(&self.engine);
            let sessions = Arc::clone(&self.sessions);
            let key = session_key.to_string();
            tokio::spawn(async move {
                debounce_waiter(engine, sessions, key, deadline, generation).await;
            });
        }
    }

    /// Number of sessions currently tracked, for status output.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Stop accepting new messages; in-flight turns run to completion.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Whether any session currently has an active turn.
    pub fn any_running(&self) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .any(|s| s.running)
    }
}

async fn debounce_waiter(
    engine: Arc<AgentEngine>,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
    session_key: String,
    deadline: Instant,
    generation: u64,
) {
    tokio::time::sleep_until(deadline).await;

    // claim the pending message, unless a newer notify owns the decision
    let first = {
        let mut map = sessions.lock().unwrap_or_else(|p| p.into_inner());
        let Some(state) = map.get_mut(&session_key) else {
            return;
        };
        if state.generation != generation || state.running {
            return;
        }
        let Some(message) = state.pending.take() else {
            return;
        };
        state.running = true;
        message
    };

    let mut trigger = first;
    loop {
        match engine.run_turn(&session_key, &trigger).await {
            Ok(outcome) => {
                info!(
                    session = %session_key,
                    iterations = outcome.iterations,
                    completed = outcome.completed,
                    "turn finished"
                );
            }
            Err(e) => {
                error!(session = %session_key, error = %e, "turn aborted");
            }
        }

        // a message that arrived mid-run starts the next turn immediately
        let mut map = sessions.lock().unwrap_or_else(|p| p.into_inner());
        let Some(state) = map.get_mut(&session_key) else {
            return;
        };
        match state.pending.take() {
            Some(next) => {
                drop(map);
                trigger = next;
            }
            None => {
                state.running = false;
                return;
            }
        }
    }
}
