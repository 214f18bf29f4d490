//! Interactive shell sessions.
//!
//! ```text
//!  stdin action ──▶ ExecHandle.resize ─┐
//!               └─▶ ExecHandle.input ──┤
//!                                      ▼
//!                              bridge task ◀──▶ ExecStream (cluster)
//!                                      │
//!                                      ▼
//!                          Outbound  (res_type = exec, one envelope per read)
//! ```
//!
//! The bridge registers its handle before it dials the cluster and drops its
//! guard only after the terminal envelope (close notice or error text) has
//! been queued.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::SessionTable;
use crate::cluster::{ClusterClient, ExecStream, PodTarget, TerminalSize};
use crate::protocol::Envelope;
use crate::tunnel::Outbound;

/// Sent as the last `exec` chunk when the remote process ends normally.
pub const CLOSE_NOTICE: &[u8] = b"\r\nconnection closed\r\n";

const INPUT_QUEUE: usize = 64;
const RESIZE_QUEUE: usize = 8;
const READ_CHUNK: usize = 8192;

/// The registry's view of a running shell.
#[derive(Clone)]
pub struct ExecHandle {
    input: mpsc::Sender<Vec<u8>>,
    resize: mpsc::Sender<TerminalSize>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum StdinError {
    #[error("Not found session id")]
    NotFound,
    /// The bridge ended between lookup and delivery.
    #[error("session {0} is closed")]
    Closed(String),
}

/// Open interactive shells, keyed by session id.
#[derive(Clone)]
pub struct ExecSessions {
    client: Arc<dyn ClusterClient>,
    outbound: Outbound,
    table: SessionTable<ExecHandle>,
}

impl ExecSessions {
    pub fn new(client: Arc<dyn ClusterClient>, outbound: Outbound) -> Self {
        Self {
            client,
            outbound,
            table: SessionTable::new(),
        }
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.table.contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Start a bridge for `session_id` and return immediately. Output and the
    /// terminal notice arrive later as `exec` envelopes.
    pub fn open(
        &self,
        session_id: String,
        target: PodTarget,
        command: Vec<String>,
        size: TerminalSize,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.bridge(session_id, target, command, size).await })
    }

    async fn bridge(
        self,
        session_id: String,
        target: PodTarget,
        command: Vec<String>,
        size: TerminalSize,
    ) {
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_QUEUE);
        let handle = ExecHandle {
            input: input_tx,
            resize: resize_tx,
        };
        let guard = match self.table.register(&session_id, handle) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%session_id, "Exec: {e}");
                self.outbound
                    .send(Envelope::exec(session_id.as_str(), e.to_string().as_bytes()));
                return;
            }
        };
        info!(
            %session_id,
            namespace = %target.namespace,
            pod = %target.name,
            "Exec: session started"
        );

        let result = match self.client.exec(&target, &command, size).await {
            Ok(stream) => self.pump(&session_id, stream, input_rx, resize_rx).await,
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => self.outbound.send(Envelope::exec(session_id.as_str(), CLOSE_NOTICE)),
            Err(msg) => {
                error!(%session_id, "Exec: stream error: {msg}");
                self.outbound
                    .send(Envelope::exec(session_id.as_str(), msg.as_bytes()));
            }
        }
        drop(guard);
        info!(%session_id, "Exec: session ended");
    }

    async fn pump(
        &self,
        session_id: &str,
        stream: ExecStream,
        mut input_rx: mpsc::Receiver<Vec<u8>>,
        mut resize_rx: mpsc::Receiver<TerminalSize>,
    ) -> Result<(), String> {
        let ExecStream {
            mut stdin,
            mut output,
            mut resizer,
        } = stream;
        let mut buf = vec![0u8; READ_CHUNK];

        let result: io::Result<()> = loop {
            tokio::select! {
                biased;
                Some(size) = resize_rx.recv() => {
                    if let Err(e) = resizer.resize(size) {
                        warn!(session_id, "Exec: resize failed: {e}");
                    }
                }
                read = output.read(&mut buf) => match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => self.outbound.send(Envelope::exec(session_id, &buf[..n])),
                    Err(e) => break Err(e),
                },
                Some(bytes) = input_rx.recv() => {
                    if let Err(e) = write_input(&mut stdin, &bytes).await {
                        break Err(e);
                    }
                }
            }
        };
        result.map_err(|e| e.to_string())
    }

    /// Deliver a resize (if any) and then `input` to the session's shell.
    pub async fn write_stdin(
        &self,
        session_id: &str,
        input: Vec<u8>,
        resize: Option<TerminalSize>,
    ) -> Result<(), StdinError> {
        let handle = self.table.get(session_id).ok_or(StdinError::NotFound)?;
        let closed = || StdinError::Closed(session_id.to_string());
        if let Some(size) = resize {
            handle.resize.send(size).await.map_err(|_| closed())?;
        }
        handle.input.send(input).await.map_err(|_| closed())
    }
}

async fn write_input(
    stdin: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    bytes: &[u8],
) -> io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}
