//! Docker Engine API adapter
//!
//! This module provides the thin container-runtime interface the sandbox
//! orchestrator drives: create, start, wait, read combined logs, kill, delete.
//! The client speaks the Engine HTTP API over the daemon's Unix socket.

pub mod client;
pub mod logs;
pub mod payload;

pub use client::{DockerClient, DockerError};
pub use payload::{ContainerCreate, HostConfig};

use async_trait::async_trait;

/// The container operations the orchestrator needs.
///
/// Kept deliberately narrow so tests can substitute an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its id.
    async fn create(&self, name: &str, body: &ContainerCreate) -> Result<String, DockerError>;

    /// Start a created container.
    async fn start(&self, id: &str) -> Result<(), DockerError>;

    /// Block until the container exits; returns its exit status.
    async fn wait(&self, id: &str) -> Result<i64, DockerError>;

    /// Read combined stdout/stderr produced so far, demuxed in stream order.
    async fn combined_logs(&self, id: &str) -> Result<String, DockerError>;

    /// Kill the container's main process. Must tolerate already-exited containers.
    async fn kill(&self, id: &str) -> Result<(), DockerError>;

    /// Force-remove the container.
    async fn remove(&self, id: &str) -> Result<(), DockerError>;
}
