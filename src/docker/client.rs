//! Docker Engine API client
//!
//! Talks to the daemon over its Unix socket with a hyper legacy client and
//! the `hyperlocal` connector. Only the handful of endpoints the sandbox
//! orchestrator needs are exposed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;

use super::logs::demux_combined;
use super::payload::{ApiErrorBody, ContainerCreate, ContainerCreated, WaitResponse};
use super::ContainerRuntime;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// Error type for Engine API operations
#[derive(Debug)]
pub enum DockerError {
    /// Transport-level failure talking to the socket
    Transport(String),
    /// Daemon returned a non-success status
    Api { status: u16, message: String },
    /// Response body did not parse
    Parse(serde_json::Error),
    /// Request body could not be built
    Request(hyper::http::Error),
}

impl std::fmt::Display for DockerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DockerError::Transport(msg) => write!(f, "docker transport error: {}", msg),
            DockerError::Api { status, message } => {
                write!(f, "docker API error ({}): {}", status, message)
            }
            DockerError::Parse(e) => write!(f, "docker response parse error: {}", e),
            DockerError::Request(e) => write!(f, "docker request build error: {}", e),
        }
    }
}

impl std::error::Error for DockerError {}

impl From<serde_json::Error> for DockerError {
    fn from(e: serde_json::Error) -> Self {
        DockerError::Parse(e)
    }
}

impl From<hyper::http::Error> for DockerError {
    fn from(e: hyper::http::Error) -> Self {
        DockerError::Request(e)
    }
}

/// Client for the Docker Engine HTTP API over a Unix socket
pub struct DockerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl DockerClient {
    /// Create a client for the daemon socket (normally `/var/run/docker.sock`).
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and return the raw response body, mapping non-2xx
    /// statuses to `DockerError::Api`.
    async fn send_raw(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, DockerError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();

        let mut builder = hyper::Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        let req = builder.body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| DockerError::Transport(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&bytes)
                .map(|b| b.message)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(DockerError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(bytes)
    }

    async fn send_json<T: Serialize>(
        &self,
        method: Method,
        endpoint: &str,
        body: &T,
    ) -> Result<Bytes, DockerError> {
        let json = serde_json::to_vec(body)?;
        self.send_raw(method, endpoint, Some(json)).await
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn create(&self, name: &str, body: &ContainerCreate) -> Result<String, DockerError> {
        let endpoint = format!("/containers/create?name={}", name);
        let bytes = self.send_json(Method::POST, &endpoint, body).await?;
        let created: ContainerCreated = serde_json::from_slice(&bytes)?;
        for warning in &created.warnings {
            tracing::warn!(container = %created.id, warning, "daemon warning on create");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}/start", id);
        self.send_raw(Method::POST, &endpoint, None).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, DockerError> {
        let endpoint = format!("/containers/{}/wait", id);
        let bytes = self.send_raw(Method::POST, &endpoint, None).await?;
        let resp: WaitResponse = serde_json::from_slice(&bytes)?;
        Ok(resp.status_code)
    }

    async fn combined_logs(&self, id: &str) -> Result<String, DockerError> {
        let endpoint = format!("/containers/{}/logs?stdout=true&stderr=true", id);
        let bytes = self.send_raw(Method::GET, &endpoint, None).await?;
        Ok(demux_combined(&bytes))
    }

    async fn kill(&self, id: &str) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}/kill", id);
        match self.send_raw(Method::POST, &endpoint, None).await {
            Ok(_) => Ok(()),
            // 409: container not running - already exited, nothing to kill
            Err(DockerError::Api { status, .. })
                if status == StatusCode::CONFLICT.as_u16()
                    || status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}?force=true", id);
        match self.send_raw(Method::DELETE, &endpoint, None).await {
            Ok(_) => Ok(()),
            Err(DockerError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
