//! `kubectl`-backed cluster collaborator.
//!
//! Every operation is one `kubectl` process:
//!
//! | operation | invocation                                                        |
//! |-----------|-------------------------------------------------------------------|
//! | list      | `get <plural> (-n NS \| -A) -o json`                               |
//! | get       | `get <plural> NAME [-n NS] -o json`                                |
//! | delete    | `delete <plural> NAME [-n NS] --wait=false`                        |
//! | replace   | `replace -f - -o json` (object on stdin)                           |
//! | exec      | `exec -i -t -n NS NAME [-c C] -- CMD...` on the slave side of a PTY |
//! | logs      | `logs -f --tail=N -n NS NAME [-c C]`                               |
//! | watch     | `get <plural> [-A] --watch --output-watch-events -o json`          |
//!
//! Credentials, kubeconfig and context selection are kubectl's business; the
//! agent only forwards `--kubeconfig` / `--context` when configured.

use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ClusterClient, ClusterError, EventSource, ExecStream, LogStream, PodTarget, ResourceKind,
    TerminalSize,
};
use crate::config::KubernetesConfig;
use crate::protocol::EventKind;
use crate::pty::{self, PtyPair, PtyReader, PtyResizer};
use crate::watch::EventHandlers;

/// Runs `kubectl` for every cluster operation.
#[derive(Clone)]
pub struct Kubectl {
    inner: Arc<Inner>,
}

struct Inner {
    binary: String,
    global_args: Vec<String>,
    watch_restart: Duration,
    shutdown: CancellationToken,
}

impl Kubectl {
    /// `shutdown` stops every watch process started through [`EventSource`].
    pub fn new(config: &KubernetesConfig, shutdown: CancellationToken) -> Self {
        let mut global_args = Vec::new();
        if let Some(path) = &config.kubeconfig {
            global_args.push("--kubeconfig".to_string());
            global_args.push(path.clone());
        }
        if let Some(context) = &config.context {
            global_args.push("--context".to_string());
            global_args.push(context.clone());
        }
        Self {
            inner: Arc::new(Inner {
                binary: config.kubectl.clone(),
                global_args,
                watch_restart: Duration::from_secs(config.watch_restart_secs),
                shutdown,
            }),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.inner.binary);
        cmd.args(&self.inner.global_args).kill_on_drop(true);
        cmd
    }

    /// Run to completion and return stdout, or the classified failure.
    async fn run(&self, args: &[String], stdin: Option<Vec<u8>>) -> Result<Vec<u8>, ClusterError> {
        debug!(?args, "kubectl");
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&bytes).await?;
            pipe.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(classify_failure(
                output.status.code().unwrap_or(-1),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn watch(&self, kind: ResourceKind, handlers: EventHandlers) {
        let this = self.clone();
        tokio::spawn(async move {
            let shutdown = this.inner.shutdown.clone();
            loop {
                let outcome = tokio::select! {
                    () = shutdown.cancelled() => break,
                    outcome = this.watch_once(kind, &handlers) => outcome,
                };
                match outcome {
                    Ok(()) => warn!(kind = kind.plural, "Watch: stream ended, restarting"),
                    Err(e) => warn!(kind = kind.plural, "Watch: {e}, restarting"),
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(this.inner.watch_restart) => {}
                }
            }
            debug!(kind = kind.plural, "Watch: stopped");
        });
    }

    async fn watch_once(&self, kind: ResourceKind, handlers: &EventHandlers) -> Result<(), ClusterError> {
        let mut cmd = self.command();
        cmd.args(watch_args(kind))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd.spawn()?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "watch stdout unavailable"))?;
        info!(kind = kind.plural, "Watch: started");

        let mut decoder = WatchDecoder::default();
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for frame in decoder.push(&buf[..n]) {
                if let Some((event, object)) = watch_event(frame) {
                    handlers.call(event, object);
                }
            }
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(ClusterError::Command {
                status: status.code().unwrap_or(-1),
                stderr: String::new(),
            })
        }
    }
}

#[async_trait]
impl ClusterClient for Kubectl {
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> Result<Vec<Value>, ClusterError> {
        let stdout = self.run(&list_args(kind, namespace), None).await?;
        let mut list: Value = serde_json::from_slice(&stdout)?;
        match list.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => Ok(items),
            _ => Ok(Vec::new()),
        }
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Value, ClusterError> {
        let mut args = vec!["get".to_string(), kind.plural.to_string(), name.to_string()];
        push_namespace(&mut args, kind, namespace);
        args.extend(["-o".to_string(), "json".to_string()]);
        let stdout = self.run(&args, None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        let mut args = vec!["delete".to_string(), kind.plural.to_string(), name.to_string()];
        push_namespace(&mut args, kind, namespace);
        args.push("--wait=false".to_string());
        self.run(&args, None).await.map(drop)
    }

    async fn replace(&self, _kind: ResourceKind, object: &Value) -> Result<Value, ClusterError> {
        let args = ["replace", "-f", "-", "-o", "json"].map(String::from);
        let stdout = self.run(&args, Some(serde_json::to_vec(object)?)).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn exec(
        &self,
        target: &PodTarget,
        command: &[String],
        size: TerminalSize,
    ) -> Result<ExecStream, ClusterError> {
        let pty = pty::allocate_pty(size)?;
        let mut cmd = self.command();
        cmd.args(exec_args(target, command));
        let child = pty::spawn_on_pty(&mut cmd, &pty)?;
        let PtyPair { master, slave } = pty;
        drop(slave);

        let stdin = pty::master_file(&master)?;
        let output = PtyReader::new(&master)?;
        Ok(ExecStream {
            stdin: Box::new(stdin),
            output: Box::new(ChildOutput {
                reader: output,
                _child: child,
            }),
            resizer: Box::new(PtyResizer::new(master)),
        })
    }

    async fn logs(&self, target: &PodTarget, tail: u32) -> Result<LogStream, ClusterError> {
        let mut cmd = self.command();
        cmd.args(log_args(target, tail))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        // kubectl exits quickly with a message on stderr when the pod or
        // container is unknown; surface that as the open failure.
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "logs stdout unavailable"))?;
        let mut first = vec![0u8; 8192];
        let n = stdout.read(&mut first).await?;
        if n == 0 {
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(classify_failure(
                    output.status.code().unwrap_or(-1),
                    &String::from_utf8_lossy(&output.stderr),
                ));
            }
            return Ok(Box::new(io::Cursor::new(Vec::<u8>::new())));
        }
        first.truncate(n);
        Ok(Box::new(ChildOutput {
            reader: io::Cursor::new(first).chain(stdout),
            _child: child,
        }))
    }
}

impl EventSource for Kubectl {
    fn subscribe(&self, kind: ResourceKind, handlers: EventHandlers) {
        self.watch(kind, handlers);
    }
}

/// A reader that keeps its producing process alive; dropping it kills the
/// process.
struct ChildOutput<R> {
    reader: R,
    _child: Child,
}

impl<R: AsyncRead + Unpin> AsyncRead for ChildOutput<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

fn push_namespace(args: &mut Vec<String>, kind: ResourceKind, namespace: &str) {
    if kind.namespaced && !namespace.is_empty() {
        args.push("-n".to_string());
        args.push(namespace.to_string());
    }
}

fn list_args(kind: ResourceKind, namespace: Option<&str>) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.plural.to_string()];
    if kind.namespaced {
        match namespace.filter(|ns| !ns.is_empty()) {
            Some(ns) => args.extend(["-n".to_string(), ns.to_string()]),
            None => args.push("-A".to_string()),
        }
    }
    args.extend(["-o".to_string(), "json".to_string()]);
    args
}

fn watch_args(kind: ResourceKind) -> Vec<String> {
    let mut args = vec!["get".to_string(), kind.plural.to_string()];
    if kind.namespaced {
        args.push("-A".to_string());
    }
    args.extend(
        ["--watch", "--output-watch-events", "-o", "json"]
            .into_iter()
            .map(String::from),
    );
    args
}

fn exec_args(target: &PodTarget, command: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-i".to_string(),
        "-t".to_string(),
        "-n".to_string(),
        target.namespace.clone(),
        target.name.clone(),
    ];
    if let Some(container) = target.container.as_deref().filter(|c| !c.is_empty()) {
        args.extend(["-c".to_string(), container.to_string()]);
    }
    args.push("--".to_string());
    args.extend(command.iter().cloned());
    args
}

fn log_args(target: &PodTarget, tail: u32) -> Vec<String> {
    let mut args = vec![
        "logs".to_string(),
        "-f".to_string(),
        format!("--tail={tail}"),
        "-n".to_string(),
        target.namespace.clone(),
        target.name.clone(),
    ];
    if let Some(container) = target.container.as_deref().filter(|c| !c.is_empty()) {
        args.extend(["-c".to_string(), container.to_string()]);
    }
    args
}

/// Map a failed kubectl invocation to a [`ClusterError`].
pub fn classify_failure(status: i32, stderr: &str) -> ClusterError {
    let message = stderr.trim().trim_start_matches("Error from server").trim();
    let message = message
        .strip_prefix("(NotFound):")
        .or_else(|| message.strip_prefix("(Conflict):"))
        .unwrap_or(message)
        .trim()
        .to_string();
    if stderr.contains("(NotFound)") || stderr.contains("not found") {
        ClusterError::NotFound(message)
    } else if stderr.contains("(Conflict)") || stderr.contains("the object has been modified") {
        ClusterError::Conflict(message)
    } else {
        ClusterError::Command {
            status,
            stderr: stderr.trim().to_string(),
        }
    }
}

/// Splits the concatenated JSON documents of `--watch -o json` output.
#[derive(Default)]
pub struct WatchDecoder {
    buf: Vec<u8>,
}

impl WatchDecoder {
    /// Feed a chunk and return every document it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let consumed = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(frame)) => frames.push(frame),
                    Some(Err(e)) if e.is_eof() => break stream.byte_offset(),
                    Some(Err(e)) => {
                        warn!("Watch: discarding undecodable output: {e}");
                        break self.buf.len();
                    }
                    None => break self.buf.len(),
                }
            }
        };
        self.buf.drain(..consumed);
        frames
    }
}

/// `{"type": "ADDED", "object": {...}}` → `(Add, object)`. Bookmarks and
/// error frames yield `None`.
pub fn watch_event(mut frame: Value) -> Option<(EventKind, Value)> {
    let event = match frame.get("type").and_then(Value::as_str)? {
        "ADDED" => EventKind::Add,
        "MODIFIED" => EventKind::Update,
        "DELETED" => EventKind::Delete,
        _ => return None,
    };
    Some((event, frame.get_mut("object")?.take()))
}
