//! Follow-mode log sessions.
//!
//! `openLog` registers a cancellation token under the session id, opens the
//! stream and copies every read into one `log` envelope. `closeLog` fires the
//! token; the bridge drops the reader (closing the underlying stream) and
//! unregisters. A failure to open the stream is reported as a single `log`
//! envelope carrying the error text.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::SessionTable;
use crate::cluster::{ClusterClient, PodTarget};
use crate::protocol::Envelope;
use crate::tunnel::Outbound;

const READ_CHUNK: usize = 8192;

#[derive(Clone)]
pub struct LogSessions {
    client: Arc<dyn ClusterClient>,
    outbound: Outbound,
    table: SessionTable<CancellationToken>,
    tail_lines: u32,
}

impl LogSessions {
    pub fn new(client: Arc<dyn ClusterClient>, outbound: Outbound, tail_lines: u32) -> Self {
        Self {
            client,
            outbound,
            table: SessionTable::new(),
            tail_lines,
        }
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.table.contains(session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Start tailing `target` for `session_id` and return immediately.
    pub fn open(&self, session_id: String, target: PodTarget) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.bridge(session_id, target).await })
    }

    /// Stop the session if it exists. Returns whether one was found.
    pub fn close(&self, session_id: &str) -> bool {
        match self.table.get(session_id) {
            Some(cancel) => {
                info!(session_id, "Log: closing session");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn bridge(self, session_id: String, target: PodTarget) {
        let cancel = CancellationToken::new();
        let _guard = match self.table.register(&session_id, cancel.clone()) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%session_id, "Log: {e}");
                self.outbound
                    .send(Envelope::log(session_id.as_str(), e.to_string().as_bytes()));
                return;
            }
        };

        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            opened = self.client.logs(&target, self.tail_lines) => opened,
        };
        let mut reader = match opened {
            Ok(reader) => reader,
            Err(e) => {
                error!(%session_id, "Log: open stream error: {e}");
                self.outbound
                    .send(Envelope::log(session_id.as_str(), e.to_string().as_bytes()));
                return;
            }
        };
        info!(
            %session_id,
            namespace = %target.namespace,
            pod = %target.name,
            "Log: session started"
        );

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => self.outbound.send(Envelope::log(session_id.as_str(), &buf[..n])),
                    Err(e) => {
                        error!(%session_id, "Log: copy error: {e}");
                        self.outbound
                            .send(Envelope::log(session_id.as_str(), e.to_string().as_bytes()));
                        break;
                    }
                },
            }
        }
        drop(reader);
        info!(%session_id, "Log: session ended");
    }
}
