//! Wires the components together and runs them until shutdown.
//!
//! ```text
//!            ┌──────────── Tunnel (reader) ─────────────┐
//!            │ mpsc<Request>                             │
//!            ▼                                           │
//!       Dispatcher ──▶ CommandRegistry ──▶ handlers      │
//!            │                               │           │
//!            │         WatchGate ◀── EventSource         │
//!            │             │          Exec/Log sessions  │
//!            ▼             ▼               ▼             │
//!            └────────────── Outbound ─────┴──▶ Tunnel (writer)
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cluster::{ClusterClient, EventSource};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::registry::CommandRegistry;
use crate::resources::{self, PodSessions};
use crate::sessions::{ExecSessions, LogSessions};
use crate::tunnel::{ConnectionState, Outbound, TransportStats, Tunnel, TunnelSettings};
use crate::watch::WatchGate;

/// A fully wired agent, ready to run.
pub struct Agent {
    tunnel: Tunnel,
    dispatcher: Dispatcher,
    requests: mpsc::Receiver<crate::protocol::Request>,
    outbound: Outbound,
}

impl Agent {
    /// Build every component and register all handlers. Must be called
    /// inside a Tokio runtime, since event sources may start tasks.
    pub fn new(
        config: &Config,
        client: Arc<dyn ClusterClient>,
        events: &dyn EventSource,
    ) -> Self {
        let outbound = Outbound::new(config.transport.outbound_queue_size);
        let (request_tx, request_rx) = mpsc::channel(config.transport.request_queue_size.max(1));

        let gate = WatchGate::new(outbound.clone());
        let pod_sessions = PodSessions::new(
            ExecSessions::new(Arc::clone(&client), outbound.clone()),
            LogSessions::new(
                Arc::clone(&client),
                outbound.clone(),
                config.sessions.log_tail_lines,
            ),
        );

        let mut registry = CommandRegistry::new();
        resources::register_all(&mut registry, &client, events, &gate, &pod_sessions);
        info!(
            resources = registry.resources().len(),
            "Agent: handlers registered"
        );

        let settings = TunnelSettings::from_config(&config.server, &config.transport);
        Self {
            tunnel: Tunnel::new(settings, outbound.clone(), request_tx),
            dispatcher: Dispatcher::new(Arc::new(registry), outbound.clone()),
            requests: request_rx,
            outbound,
        }
    }

    /// Connection state as seen by the tunnel, for callers that want to
    /// report it.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.tunnel.state()
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        self.tunnel.stats()
    }

    /// Run the tunnel and the dispatcher until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let tunnel = self.tunnel.spawn(shutdown.clone());
        self.dispatcher.run(self.requests, shutdown.clone()).await;
        if let Err(e) = tunnel.await {
            error!("Agent: tunnel task failed: {e}");
        }
        info!(
            dropped_outbound = self.outbound.dropped(),
            "Agent: stopped"
        );
    }
}
