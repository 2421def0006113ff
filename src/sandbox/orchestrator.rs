//! Sandbox orchestrator - one bounded, isolated container run per request
//!
//! The orchestrator owns the global concurrency semaphore, the per-session
//! live-container registry and the idle reaper. Each `execute` call runs the
//! request's code in a fresh container against the session's reused working
//! directory, classifies the outcome into an [`ExecStopType`], persists an
//! execution record and re-arms the session's idle timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::reaper::{IdleReaper, LiveContainers};
use super::stop_type::{strip_sentinel, truncate_output, ExecStopType};
use super::workspace::{SandboxWorkspace, CODE_FILE, SHIM_FILE};
use crate::config::CoreConfig;
use crate::docker::{ContainerCreate, ContainerRuntime, DockerError, HostConfig};
use crate::metrics::{SANDBOX_ACTIVE, SANDBOX_EXECUTIONS, SANDBOX_EXEC_DURATION, SANDBOX_SLOT_WAIT};
use crate::records::{ExecutionRecord, ExecutionRequest, RecordStore};

/// Outcome of one sandbox run.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    /// Sentinel-stripped output, truncated to the configured character cap
    pub final_output: String,
    /// Sentinel-stripped output without the cap
    pub raw_output: String,
    pub stop_type: ExecStopType,
}

/// Error type for orchestrator operations. Sandbox-level outcomes (including
/// timeouts) are not errors; only infrastructure failures land here.
#[derive(Debug)]
pub enum SandboxError {
    /// Container engine failure (create/start/wait/logs)
    Runtime(DockerError),
    /// Workspace materialization failure
    Workspace(std::io::Error),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Runtime(e) => write!(f, "container runtime error: {}", e),
            SandboxError::Workspace(e) => write!(f, "workspace error: {}", e),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<DockerError> for SandboxError {
    fn from(e: DockerError) -> Self {
        SandboxError::Runtime(e)
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Workspace(e)
    }
}

pub struct SandboxOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    workspace: SandboxWorkspace,
    records: RecordStore,
    semaphore: Arc<Semaphore>,
    live: LiveContainers,
    reaper: IdleReaper,
    config: CoreConfig,
}

impl SandboxOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: CoreConfig) -> std::io::Result<Self> {
        let workspace = SandboxWorkspace::new(&config.workspace_root, &config.host_api_url);
        std::fs::create_dir_all(&config.deps_cache_dir)?;
        std::fs::create_dir_all(&config.uploads_root)?;
        let records = RecordStore::new(&config.records_path)?;
        let live: LiveContainers = Arc::new(Mutex::new(HashMap::new()));
        let reaper = IdleReaper::new(
            config.idle_cleanup,
            workspace.clone(),
            Arc::clone(&runtime),
            Arc::clone(&live),
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_sandboxes)),
            runtime,
            workspace,
            records,
            live,
            reaper,
            config,
        })
    }

    /// Run one request to a terminal stop type.
    ///
    /// Blocks (without timeout) on the global semaphore when the configured
    /// sandbox ceiling is reached - the sole global backpressure mechanism.
    pub async fn execute(&self, req: &ExecutionRequest) -> Result<SandboxRun, SandboxError> {
        let turn_start = Instant::now();

        let slot_start = Instant::now();
        // closed() is never called on this semaphore, acquire cannot fail
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| {
                SandboxError::Workspace(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        SANDBOX_SLOT_WAIT.observe(slot_start.elapsed().as_secs_f64());

        // a timer armed by the previous run must not fire mid-run
        self.reaper.cancel(&req.session_key);

        let workdir = self.workspace.materialize(&req.session_key, &req.code)?;

        // One live container per session: remove any predecessor first.
        let predecessor = self
            .live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&req.session_key);
        if let Some(old_id) = predecessor {
            debug!(session = %req.session_key, container = %old_id, "removing predecessor container");
            if let Err(e) = self.runtime.remove(&old_id).await {
                warn!(session = %req.session_key, container = %old_id, error = %e,
                      "failed to remove predecessor container");
            }
        }

        let name = format!(
            "{}-{}",
            SandboxWorkspace::dir_name(&req.session_key),
            uuid::Uuid::now_v7().simple()
        );
        let body = self.container_body(req, &workdir);

        SANDBOX_ACTIVE.inc();
        let run = self.drive_container(req, &name, &body).await;
        SANDBOX_ACTIVE.dec();

        let exec_time_ms = turn_start.elapsed().as_millis() as u64;
        SANDBOX_EXEC_DURATION.observe(turn_start.elapsed().as_secs_f64());

        let run = run?;
        SANDBOX_EXECUTIONS
            .with_label_values(&[run.stop_type.as_str()])
            .inc();
        info!(
            session = %req.session_key,
            stop_type = run.stop_type.as_str(),
            exec_time_ms,
            "sandbox run finished"
        );

        self.persist_record(req, &run, exec_time_ms);
        self.reaper.schedule(&req.session_key);

        Ok(run)
    }

    /// Create, start, wait (with the wall-clock limit), collect output and
    /// tear down one container.
    async fn drive_container(
        &self,
        req: &ExecutionRequest,
        name: &str,
        body: &ContainerCreate,
    ) -> Result<SandboxRun, SandboxError> {
        let id = self.runtime.create(name, body).await?;
        self.live
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(req.session_key.clone(), id.clone());

        if let Err(e) = self.runtime.start(&id).await {
            self.teardown(&req.session_key, &id).await;
            return Err(e.into());
        }

        let waited = tokio::time::timeout(self.config.sandbox_timeout, self.runtime.wait(&id)).await;

        let (raw, stop_type) = match waited {
            // container exited; outcome comes from the sentinel, not the code
            Ok(Ok(_exit_status)) => {
                let logs = match self.runtime.combined_logs(&id).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        self.teardown(&req.session_key, &id).await;
                        return Err(e.into());
                    }
                };
                let (stripped, sentinel) = strip_sentinel(&logs);
                (stripped, sentinel.unwrap_or(ExecStopType::Error))
            }
            Ok(Err(e)) => {
                self.teardown(&req.session_key, &id).await;
                return Err(e.into());
            }
            Err(_elapsed) => {
                warn!(session = %req.session_key, container = %id, "sandbox hit wall-clock limit, killing");
                // best-effort: whatever the code printed before the kill
                let partial = self.runtime.combined_logs(&id).await.unwrap_or_default();
                if let Err(e) = self.runtime.kill(&id).await {
                    warn!(container = %id, error = %e, "kill after timeout failed");
                }
                // no sentinel parsing on the timeout path
                (partial, ExecStopType::Timeout)
            }
        };

        self.teardown(&req.session_key, &id).await;

        Ok(SandboxRun {
            final_output: truncate_output(&raw, self.config.output_char_cap),
            raw_output: raw,
            stop_type,
        })
    }

    fn container_body(&self, req: &ExecutionRequest, workdir: &std::path::Path) -> ContainerCreate {
        let uploads = self
            .config
            .uploads_root
            .join(SandboxWorkspace::dir_name(&req.session_key));
        ContainerCreate {
            image: self.config.sandbox_image.clone(),
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), exec_pipeline()],
            env: vec![
                format!("SANDBOT_SESSION_KEY={}", req.session_key),
                format!("SANDBOT_HOST_API={}", self.config.host_api_url),
            ],
            working_dir: "/app".to_string(),
            tty: false,
            host_config: HostConfig {
                binds: vec![
                    format!("{}:/sandbox/shared", workdir.display()),
                    format!("{}:/sandbox/packages", self.config.deps_cache_dir.display()),
                    format!("{}:/sandbox/uploads:ro", uploads.display()),
                ],
                memory: self.config.sandbox_memory_bytes,
                nano_cpus: self.config.sandbox_nano_cpus,
                network_mode: "bridge".to_string(),
                extra_hosts: vec!["host.docker.internal:host-gateway".to_string()],
                security_opt: vec!["no-new-privileges".to_string()],
                privileged: false,
                auto_remove: false,
            },
        }
    }

    /// Remove a container and deregister it. Failures are logged, not
    /// propagated: the reaper retries removal of anything left registered.
    async fn teardown(&self, session_key: &str, id: &str) {
        if let Err(e) = self.runtime.remove(id).await {
            warn!(session = %session_key, container = %id, error = %e, "container remove failed");
            return; // leave it registered for the reaper
        }
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        if live.get(session_key).map(String::as_str) == Some(id) {
            live.remove(session_key);
        }
    }

    fn persist_record(&self, req: &ExecutionRequest, run: &SandboxRun, exec_time_ms: u64) {
        let record = ExecutionRecord {
            session_key: req.session_key.clone(),
            code: req.code.clone(),
            thoughts: req.thoughts.clone(),
            outputs: run.final_output.clone(),
            success: run.stop_type.is_success(),
            stop_type: run.stop_type,
            exec_time_ms,
            generation_time_ms: req.generation_time_ms,
            total_time_ms: exec_time_ms + req.generation_time_ms,
            trigger_user: req.trigger_user.clone(),
            metrics: serde_json::json!({
                "trace_id": req.trace_id,
                "prompt_tokens": req.prompt_tokens,
                "completion_tokens": req.completion_tokens,
                "trigger_message_id": req.trigger_message_id,
            }),
            created_at: chrono::Utc::now(),
        };
        // bookkeeping only; a failed insert must not abort the conversation
        if let Err(e) = self.records.append(&record) {
            warn!(session = %req.session_key, error = %e, "failed to persist execution record");
        }
    }

    /// Records handle, for diagnostics.
    pub fn records(&self) -> &RecordStore {
        &self.records
    }
}

/// The fixed in-container pipeline: deliver the two files, run the code, and
/// report the exit code as exactly one sentinel on stdout.
fn exec_pipeline() -> String {
    format!(
        concat!(
            "cp /sandbox/shared/{code} /app/{code} && cp /sandbox/shared/{shim} /app/{shim} ",
            "&& cd /app; python3 {code}; rc=$?; case \"$rc\" in ",
            "0) echo '{normal}';; ",
            "8) echo '{agent}';; ",
            "9) echo '{manual}';; ",
            "11) echo '{multimodal}';; ",
            "*) echo '{error}';; esac"
        ),
        code = CODE_FILE,
        shim = SHIM_FILE,
        normal = ExecStopType::Normal.sentinel(),
        agent = ExecStopType::Agent.sentinel(),
        manual = ExecStopType::Manual.sentinel(),
        multimodal = ExecStopType::MultimodalAgent.sentinel(),
        error = ExecStopType::Error.sentinel(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_covers_every_mapped_exit_code() {
        let pipeline = exec_pipeline();
        assert!(pipeline.contains("0) echo"));
        assert!(pipeline.contains("8) echo"));
        assert!(pipeline.contains("9) echo"));
        assert!(pipeline.contains("11) echo"));
        assert!(pipeline.contains("*) echo"));
        assert!(pipeline.contains(ExecStopType::Normal.sentinel()));
        assert!(pipeline.contains(ExecStopType::Error.sentinel()));
        // timeout is detected host-side, never echoed
        assert!(!pipeline.contains(ExecStopType::Timeout.sentinel()));
        assert!(!pipeline.contains(ExecStopType::Security.sentinel()));
    }
}
