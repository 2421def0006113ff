//! Session idle reaper
//!
//! One cancellable delayed task per session: after the idle window passes
//! with no newer sandbox run, the session's working directory is deleted and
//! any still-registered container is force-removed. Scheduling again for the
//! same session aborts and replaces the previous task, so timers never race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::workspace::SandboxWorkspace;
use crate::docker::ContainerRuntime;
use crate::metrics::SESSIONS_REAPED;

/// Registry of the (at most one) live container per session, shared with the
/// orchestrator.
pub type LiveContainers = Arc<Mutex<HashMap<String, String>>>;

pub struct IdleReaper {
    idle_window: Duration,
    workspace: SandboxWorkspace,
    runtime: Arc<dyn ContainerRuntime>,
    live: LiveContainers,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl IdleReaper {
    pub fn new(
        idle_window: Duration,
        workspace: SandboxWorkspace,
        runtime: Arc<dyn ContainerRuntime>,
        live: LiveContainers,
    ) -> Self {
        Self {
            idle_window,
            workspace,
            runtime,
            live,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// (Re)arm the idle timer for a session, replacing any prior one.
    pub fn schedule(&self, session_key: &str) {
        let key = session_key.to_string();
        let window = self.idle_window;
        let workspace = self.workspace.clone();
        let runtime = Arc::clone(&self.runtime);
        let live = Arc::clone(&self.live);
        let timers = Arc::clone(&self.timers);

        let handle = tokio::spawn({
            let key = key.clone();
            async move {
                tokio::time::sleep(window).await;

                debug!(session = %key, "idle window elapsed, reaping session");
                let lingering = live.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
                if let Some(container_id) = lingering {
                    if let Err(e) = runtime.remove(&container_id).await {
                        warn!(session = %key, container = %container_id, error = %e,
                              "failed to remove lingering container");
                    }
                }
                if let Err(e) = workspace.remove(&key) {
                    warn!(session = %key, error = %e, "failed to remove session workspace");
                }
                timers.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
                SESSIONS_REAPED.inc();
            }
        });

        let previous = self
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, handle);
        if let Some(old) = previous {
            old.abort();
        }
    }

    /// Cancel a pending timer without reaping (used on shutdown).
    pub fn cancel(&self, session_key: &str) {
        if let Some(handle) = self
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_key)
        {
            handle.abort();
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        let mut timers = match self.timers.lock() {
            Ok(t) => t,
            Err(p) => p.into_inner(),
        };
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}
