//! Collaborator interfaces to the managed cluster.
//!
//! Resource adapters never talk to the cluster directly; they receive an
//! `Arc<dyn ClusterClient>` (and the watch wiring an `&dyn EventSource`) at
//! construction. The binary plugs in [`kubectl::Kubectl`]; tests plug in the
//! in-memory cluster from `testing`.

pub mod kubectl;
#[cfg(test)]
pub mod testing;

use std::io;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::watch::EventHandlers;

/// Failure reported by a cluster collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{0}")]
    NotFound(String),
    /// Optimistic-concurrency conflict: the object changed since it was read.
    #[error("{0}")]
    Conflict(String),
    #[error("command exited with status {status}: {stderr}")]
    Command { status: i32, stderr: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ClusterError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// API-level identity of a resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    /// Plural resource name as the API server knows it, e.g. `deployments`.
    pub plural: &'static str,
    pub namespaced: bool,
}

impl ResourceKind {
    pub const fn namespaced(plural: &'static str) -> Self {
        Self {
            plural,
            namespaced: true,
        }
    }

    pub const fn cluster_scoped(plural: &'static str) -> Self {
        Self {
            plural,
            namespaced: false,
        }
    }
}

/// One container of one pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub name: String,
    /// `None` selects the pod's default container.
    pub container: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Applies terminal size changes to a running interactive stream.
pub trait Resize: Send {
    fn resize(&mut self, size: TerminalSize) -> io::Result<()>;
}

/// A running interactive process in a container, attached to a terminal.
///
/// Dropping the stream terminates the remote process.
pub struct ExecStream {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Merged stdout/stderr of the terminal. EOF means the process ended.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub resizer: Box<dyn Resize>,
}

/// A follow-mode log stream. Dropping the reader closes the stream.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Resource-handler collaborator.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Every object of `kind`, optionally restricted to one namespace.
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>)
        -> Result<Vec<Value>, ClusterError>;

    /// `namespace` is ignored for cluster-scoped kinds.
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<Value, ClusterError>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str)
        -> Result<(), ClusterError>;

    /// Replace an object wholesale. Fails with [`ClusterError::Conflict`] when
    /// `object`'s `metadata.resourceVersion` is stale.
    async fn replace(&self, kind: ResourceKind, object: &Value) -> Result<Value, ClusterError>;

    async fn exec(
        &self,
        target: &PodTarget,
        command: &[String],
        size: TerminalSize,
    ) -> Result<ExecStream, ClusterError>;

    /// Last `tail` lines of the container log, then live-follow.
    async fn logs(&self, target: &PodTarget, tail: u32) -> Result<LogStream, ClusterError>;
}

/// Event-source collaborator: delivers add/update/delete notifications for
/// a resource kind to the registered callbacks.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, kind: ResourceKind, handlers: EventHandlers);
}

/// `metadata.name` of a raw object, or `""`.
pub fn object_name(object: &Value) -> &str {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// `metadata.namespace` of a raw object, or `""` for cluster-scoped objects.
pub fn object_namespace(object: &Value) -> &str {
    object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
}
