//! Docker Engine API payload structures
//!
//! These structs mirror the JSON bodies of the Engine API endpoints the
//! adapter uses. Field names follow the API's PascalCase convention.

use serde::{Deserialize, Serialize};

/// Body of `POST /containers/create`
#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreate {
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    /// Multiplexed log stream requires Tty=false
    pub tty: bool,
    pub host_config: HostConfig,
}

/// Host-level settings: mounts, resource caps, networking.
#[derive(Serialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    /// `host_path:container_path[:ro]` bind mounts
    pub binds: Vec<String>,
    /// Memory ceiling in bytes
    pub memory: i64,
    /// CPU share in units of 1e-9 CPUs
    pub nano_cpus: i64,
    pub network_mode: String,
    /// `host.docker.internal:host-gateway` so the sandbox can reach the host API
    pub extra_hosts: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub auto_remove: bool,
}

/// Response of `POST /containers/create`
#[derive(Deserialize, Debug, Clone)]
pub struct ContainerCreated {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Warnings", default)]
    pub warnings: Vec<String>,
}

/// Response of `POST /containers/{id}/wait`
#[derive(Deserialize, Debug, Clone)]
pub struct WaitResponse {
    #[serde(rename = "StatusCode")]
    pub status_code: i64,
}

/// Error body returned by the daemon on non-2xx statuses
#[derive(Deserialize, Debug, Clone)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_create_serializes_pascal_case() {
        let body = ContainerCreate {
            image: "sandbot-runner:latest".into(),
            cmd: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            env: vec!["SESSION_KEY=abc".into()],
            working_dir: "/app".into(),
            tty: false,
            host_config: HostConfig {
                binds: vec!["/tmp/w:/sandbox/shared".into()],
                memory: 1024,
                nano_cpus: 500_000_000,
                network_mode: "bridge".into(),
                extra_hosts: vec!["host.docker.internal:host-gateway".into()],
                security_opt: vec!["no-new-privileges".into()],
                privileged: false,
                auto_remove: false,
            },
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Image"], "sandbot-runner:latest");
        assert_eq!(json["HostConfig"]["NanoCpus"], 500_000_000i64);
        assert_eq!(json["HostConfig"]["NetworkMode"], "bridge");
        assert_eq!(json["Tty"], false);
    }

    #[test]
    fn wait_response_parses() {
        let resp: WaitResponse = serde_json::from_str(r#"{"StatusCode": 8}"#).unwrap();
        assert_eq!(resp.status_code, 8);
    }
}
