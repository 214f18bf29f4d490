//! In-memory cluster for unit tests.
//!
//! Objects live in a map keyed by resource plural. Interactive shells and log
//! streams are `tokio::io::duplex` pairs whose far ends are handed to the test
//! through [`FakeCluster::next_shell`] and [`FakeCluster::next_log`].

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use super::{
    object_name, object_namespace, ClusterClient, ClusterError, ExecStream, LogStream, PodTarget,
    Resize, ResourceKind, TerminalSize,
};
use crate::watch::EventHandlers;

/// Far end of an exec stream.
pub struct RemoteShell {
    pub target: PodTarget,
    pub command: Vec<String>,
    pub size: TerminalSize,
    /// What the agent wrote to the shell's stdin.
    pub input: DuplexStream,
    /// Write here to produce shell output.
    pub output: DuplexStream,
    pub resizes: mpsc::UnboundedReceiver<TerminalSize>,
}

impl RemoteShell {
    pub async fn read_input(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf).await.unwrap();
        buf
    }

    pub async fn write_output(&mut self, bytes: &[u8]) {
        self.output.write_all(bytes).await.unwrap();
    }
}

/// Far end of a log stream.
pub struct RemoteLog {
    pub target: PodTarget,
    pub tail: u32,
    pub writer: DuplexStream,
}

struct ChannelResizer(mpsc::UnboundedSender<TerminalSize>);

impl Resize for ChannelResizer {
    fn resize(&mut self, size: TerminalSize) -> io::Result<()> {
        self.0
            .send(size)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "resize receiver dropped"))
    }
}

pub struct FakeCluster {
    objects: Mutex<HashMap<&'static str, Vec<Value>>>,
    conflicts: AtomicU32,
    exec_error: Mutex<Option<String>>,
    log_error: Mutex<Option<String>>,
    list_error: Mutex<Option<String>>,
    shells_tx: mpsc::UnboundedSender<RemoteShell>,
    shells_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteShell>>,
    logs_tx: mpsc::UnboundedSender<RemoteLog>,
    logs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RemoteLog>>,
    replaced: Mutex<Vec<Value>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let (shells_tx, shells_rx) = mpsc::unbounded_channel();
        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            conflicts: AtomicU32::new(0),
            exec_error: Mutex::new(None),
            log_error: Mutex::new(None),
            list_error: Mutex::new(None),
            shells_tx,
            shells_rx: tokio::sync::Mutex::new(shells_rx),
            logs_tx,
            logs_rx: tokio::sync::Mutex::new(logs_rx),
            replaced: Mutex::new(Vec::new()),
        })
    }

    /// Add an object with `resourceVersion` 1.
    pub fn insert(&self, kind: ResourceKind, namespace: &str, name: &str, mut object: Value) {
        object["metadata"]["name"] = json!(name);
        if kind.namespaced {
            object["metadata"]["namespace"] = json!(namespace);
        }
        object["metadata"]["resourceVersion"] = json!("1");
        self.objects
            .lock()
            .unwrap()
            .entry(kind.plural)
            .or_default()
            .push(object);
    }

    /// Make the next `n` replaces fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_exec(&self, msg: &str) {
        *self.exec_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn fail_logs(&self, msg: &str) {
        *self.log_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn fail_list(&self, msg: &str) {
        *self.list_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Objects accepted by `replace`, in order.
    pub fn replaced(&self) -> Vec<Value> {
        self.replaced.lock().unwrap().clone()
    }

    pub fn stored(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.find(kind, namespace, name)
    }

    pub async fn next_shell(&self) -> RemoteShell {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            self.shells_rx.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap()
    }

    pub async fn next_log(&self) -> RemoteLog {
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            self.logs_rx.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap()
    }

    fn find(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(kind.plural)?
            .iter()
            .find(|o| object_name(o) == name && (!kind.namespaced || object_namespace(o) == namespace))
            .cloned()
    }

    fn not_found(kind: ResourceKind, name: &str) -> ClusterError {
        ClusterError::NotFound(format!("{} \"{name}\" not found", kind.plural))
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        if let Some(msg) = self.list_error.lock().unwrap().clone() {
            return Err(ClusterError::Command { status: 1, stderr: msg });
        }
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .get(kind.plural)
            .map(|all| {
                all.iter()
                    .filter(|o| namespace.map_or(true, |ns| object_namespace(o) == ns))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ClusterError> {
        self.find(kind, namespace, name)
            .ok_or_else(|| Self::not_found(kind, name))
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut objects = self.objects.lock().unwrap();
        let all = objects.entry(kind.plural).or_default();
        let before = all.len();
        all.retain(|o| {
            !(object_name(o) == name && (!kind.namespaced || object_namespace(o) == namespace))
        });
        if all.len() == before {
            return Err(Self::not_found(kind, name));
        }
        Ok(())
    }

    async fn replace(&self, kind: ResourceKind, object: &Value) -> Result<Value, ClusterError> {
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClusterError::Conflict(format!(
                "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                kind.plural,
                object_name(object)
            )));
        }
        let name = object_name(object).to_string();
        let namespace = object_namespace(object).to_string();
        let mut objects = self.objects.lock().unwrap();
        let all = objects.entry(kind.plural).or_default();
        let Some(slot) = all.iter_mut().find(|o| {
            object_name(o) == name && (!kind.namespaced || object_namespace(o) == namespace)
        }) else {
            return Err(Self::not_found(kind, &name));
        };
        let current: u64 = slot["metadata"]["resourceVersion"]
            .as_str()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let offered = object["metadata"]["resourceVersion"].as_str().unwrap_or("");
        if !offered.is_empty() && offered != current.to_string() {
            return Err(ClusterError::Conflict(format!(
                "{} \"{name}\" resourceVersion {offered} is stale",
                kind.plural
            )));
        }
        let mut next = object.clone();
        next["metadata"]["resourceVersion"] = json!((current + 1).to_string());
        *slot = next.clone();
        self.replaced.lock().unwrap().push(next.clone());
        Ok(next)
    }

    async fn exec(
        &self,
        target: &PodTarget,
        command: &[String],
        size: TerminalSize,
    ) -> Result<ExecStream, ClusterError> {
        if let Some(msg) = self.exec_error.lock().unwrap().clone() {
            return Err(ClusterError::NotFound(msg));
        }
        let (agent_stdin, remote_input) = tokio::io::duplex(4096);
        let (agent_output, remote_output) = tokio::io::duplex(4096);
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let _ = self.shells_tx.send(RemoteShell {
            target: target.clone(),
            command: command.to_vec(),
            size,
            input: remote_input,
            output: remote_output,
            resizes: resize_rx,
        });
        Ok(ExecStream {
            stdin: Box::new(agent_stdin),
            output: Box::new(agent_output),
            resizer: Box::new(ChannelResizer(resize_tx)),
        })
    }

    async fn logs(&self, target: &PodTarget, tail: u32) -> Result<LogStream, ClusterError> {
        if let Some(msg) = self.log_error.lock().unwrap().clone() {
            return Err(ClusterError::Command { status: 1, stderr: msg });
        }
        let (reader, writer) = tokio::io::duplex(4096);
        let _ = self.logs_tx.send(RemoteLog {
            target: target.clone(),
            tail,
            writer,
        });
        Ok(Box::new(reader))
    }
}

/// Event source that records subscriptions so tests can fire events by hand.
#[derive(Default)]
pub struct ManualEvents {
    subscriptions: Mutex<Vec<(ResourceKind, EventHandlers)>>,
}

impl ManualEvents {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, _)| kind.plural)
            .collect()
    }

    pub fn handlers(&self, plural: &str) -> EventHandlers {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .find(|(kind, _)| kind.plural == plural)
            .map(|(_, handlers)| handlers.clone())
            .unwrap()
    }
}

impl super::EventSource for ManualEvents {
    fn subscribe(&self, kind: ResourceKind, handlers: EventHandlers) {
        self.subscriptions.lock().unwrap().push((kind, handlers));
    }
}
