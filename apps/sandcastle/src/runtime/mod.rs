//! Container engine capabilities the orchestrator consumes.
//!
//! [`ContainerRuntime`] is the seam: the Docker adapter implements it against a
//! real engine, tests implement it in-process. [`RuntimeHandle`] builds the process
//! wide client on first use.

mod docker;
mod lazy;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::model::ResourceLimits;

pub use docker::DockerRuntime;
pub use lazy::{RuntimeFactory, RuntimeHandle};

pub const LABEL_MANAGED: &str = "sandcastle.managed";
pub const LABEL_SESSION: &str = "sandcastle.session";
pub const LABEL_TASK: &str = "sandcastle.task";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("image build failed: {0}")]
    Build(String),
    #[error("container engine error: {0}")]
    Engine(String),
    #[error("container stream i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Build(_) => ErrorKind::BuildFailure,
            RuntimeError::NotFound(_) => ErrorKind::SessionNotFound,
            RuntimeError::Unavailable(_) | RuntimeError::Engine(_) => ErrorKind::RuntimeUnavailable,
            RuntimeError::Io(_) => ErrorKind::BridgeError,
        }
    }
}

/// Receives build output lines as the engine produces them.
pub type LogSink = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory sent to the engine as build context.
    pub context_dir: PathBuf,
    /// Dockerfile contents; written into the context before packing.
    pub dockerfile: String,
    pub tag: String,
    pub labels: HashMap<String, String>,
}

/// A managed container as reported by the engine, independent of the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub session_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Interactive exec channel: shell output chunks and a writer for shell input.
pub struct ExecStream {
    pub output: BoxStream<'static, Result<Bytes, RuntimeError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Builds `request.tag` and returns the image id.
    async fn build_image(&self, request: BuildRequest, logs: LogSink)
        -> Result<String, RuntimeError>;

    /// Removes an image; missing images are not an error.
    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn run_container(
        &self,
        image: &str,
        name: &str,
        limits: ResourceLimits,
        labels: HashMap<String, String>,
    ) -> Result<String, RuntimeError>;

    /// Opens a fresh interactive shell with its own pty inside the container.
    async fn attach_exec(&self, container_id: &str) -> Result<ExecStream, RuntimeError>;

    /// Stops and removes; already-removed containers are not an error.
    async fn stop_and_remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Containers (running or not) carrying `key=value`.
    async fn list_by_label(&self, key: &str, value: &str)
        -> Result<Vec<ManagedContainer>, RuntimeError>;
}

pub fn managed_labels(session_id: &str, task_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_string(), "true".to_string()),
        (LABEL_SESSION.to_string(), session_id.to_string()),
        (LABEL_TASK.to_string(), task_id.to_string()),
    ])
}
