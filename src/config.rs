//! Configuration surface consumed by the core
//!
//! Everything here can be overridden from the environment (`SANDBOT_*`
//! variables); defaults are chosen so the stack runs against a local Docker
//! daemon and an OpenAI-compatible endpoint on localhost.

use std::path::PathBuf;
use std::time::Duration;

use crate::model::ModelGroupConfig;

/// Top-level configuration for the scheduler, engine and orchestrator.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Global ceiling on concurrently running sandbox containers
    pub max_concurrent_sandboxes: usize,
    /// Wall-clock limit for one sandbox run
    pub sandbox_timeout: Duration,
    /// Quiesce window before a burst of inbound messages triggers a run
    pub debounce_window: Duration,
    /// Maximum model↔sandbox iterations per conversation turn
    pub max_iterations: usize,
    /// Character budget for stored/forwarded sandbox output
    pub output_char_cap: usize,
    /// Inactivity window after which a session's workspace and container are reaped
    pub idle_cleanup: Duration,
    /// Retries per model call before the turn is abandoned
    pub model_retries: usize,
    /// Primary model group
    pub primary_group: ModelGroupConfig,
    /// Fallback group used on the final retry
    pub fallback_group: ModelGroupConfig,
    /// Docker daemon socket
    pub docker_socket: PathBuf,
    /// Image every sandbox container is created from
    pub sandbox_image: String,
    /// Memory ceiling per container, in bytes
    pub sandbox_memory_bytes: i64,
    /// CPU share per container, in units of 1e-9 CPUs (Docker `NanoCpus`)
    pub sandbox_nano_cpus: i64,
    /// Root under which per-session working directories live
    pub workspace_root: PathBuf,
    /// Shared cross-session dependency cache directory
    pub deps_cache_dir: PathBuf,
    /// Root of per-session read-only upload directories
    pub uploads_root: PathBuf,
    /// Host-side capability RPC endpoint, reachable from inside containers
    pub host_api_url: String,
    /// JSONL file execution records are appended to
    pub records_path: PathBuf,
    /// Messages of history rendered into a prompt
    pub history_max_messages: usize,
    /// Oldest history rendered into a prompt
    pub history_max_age: Duration,
    /// Character budget for rendered history
    pub history_char_budget: usize,
    /// Images embedded into one prompt at most
    pub history_max_images: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sandboxes: 4,
            sandbox_timeout: Duration::from_secs(60),
            debounce_window: Duration::from_millis(900),
            max_iterations: 6,
            output_char_cap: 6000,
            idle_cleanup: Duration::from_secs(600),
            model_retries: 2,
            primary_group: ModelGroupConfig::named("default"),
            fallback_group: ModelGroupConfig::named("fallback"),
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            sandbox_image: "sandbot-runner:latest".to_string(),
            sandbox_memory_bytes: 1024 * 1024 * 1024,
            sandbox_nano_cpus: 1_000_000_000,
            workspace_root: PathBuf::from("./data/sessions"),
            deps_cache_dir: PathBuf::from("./data/packages"),
            uploads_root: PathBuf::from("./data/uploads"),
            host_api_url: "http://host.docker.internal:8021/api".to_string(),
            records_path: PathBuf::from("./data/exec_records.jsonl"),
            history_max_messages: 32,
            history_max_age: Duration::from_secs(6 * 3600),
            history_char_budget: 6000,
            history_max_images: 3,
        }
    }
}

impl CoreConfig {
    /// Build a config from the environment, falling back to defaults.
    ///
    /// Unparseable values fall back silently; this is a convenience for the
    /// binary, library callers construct the struct directly.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("SANDBOT_MAX_CONCURRENT") {
            cfg.max_concurrent_sandboxes = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("SANDBOT_TIMEOUT_SECS") {
            cfg.sandbox_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("SANDBOT_DEBOUNCE_MS") {
            cfg.debounce_window = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("SANDBOT_MAX_ITERATIONS") {
            cfg.max_iterations = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("SANDBOT_OUTPUT_CAP") {
            cfg.output_char_cap = n;
        }
        if let Some(secs) = env_parse::<u64>("SANDBOT_IDLE_SECS") {
            cfg.idle_cleanup = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("SANDBOT_MODEL_RETRIES") {
            cfg.model_retries = n;
        }
        if let Ok(sock) = std::env::var("SANDBOT_DOCKER_SOCKET") {
            cfg.docker_socket = PathBuf::from(sock);
        }
        if let Ok(image) = std::env::var("SANDBOT_IMAGE") {
            cfg.sandbox_image = image;
        }
        if let Ok(url) = std::env::var("SANDBOT_HOST_API_URL") {
            cfg.host_api_url = url;
        }
        if let Ok(root) = std::env::var("SANDBOT_DATA_DIR") {
            let root = PathBuf::from(root);
            cfg.workspace_root = root.join("sessions");
            cfg.deps_cache_dir = root.join("packages");
            cfg.uploads_root = root.join("uploads");
            cfg.records_path = root.join("exec_records.jsonl");
        }

        cfg.primary_group = ModelGroupConfig::from_env("SANDBOT_MODEL", "default");
        cfg.fallback_group = ModelGroupConfig::from_env("SANDBOT_FALLBACK_MODEL", "fallback");

        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
