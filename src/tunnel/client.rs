//! Tunnel client: the agent's single outbound WebSocket to the control server.
//!
//! Spawned on startup. Dials `server.url + server.path` with the agent token in
//! a `token` header, then runs one reader and one writer on the connection:
//!
//! - **Reader** decodes each text frame into a [`Request`] and hands it to the
//!   dispatcher channel. A frame that fails to decode is logged and skipped;
//!   it never tears the connection down.
//! - **Writer** drains the shared [`Outbound`] queue in FIFO order and sends
//!   one frame per envelope, plus a ping every `heartbeat_interval_secs`. An
//!   envelope whose send fails is logged and dropped.
//!
//! Any read or write failure stops both halves (the writer is awaited before
//! a new dial starts, so at most one reader and one writer ever exist), then
//! the client retries immediately once and afterwards on a fixed interval
//! until it succeeds. There is no backoff growth and no retry limit.
//!
//! ```text
//! Disconnected ──dial──▶ Connecting ──ok──▶ Connected
//!      ▲                    │ err (retry every interval)   │ read/write failure
//!      └────────────────────┴──────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::outbound::Outbound;
use crate::config::{ServerConfig, TransportConfig};
use crate::protocol::Request;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Header carrying the agent token on the upgrade request.
pub const TOKEN_HEADER: &str = "token";

/// Connection state machine. Initial state is `Disconnected`; there is no
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Tunnel counters, updated lock-free on the hot path.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    /// Envelopes dropped because their send failed.
    pub failed_sends: AtomicU64,
}

/// Everything the tunnel needs to dial.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub url: String,
    pub token: String,
    pub reconnect_interval: Duration,
    pub heartbeat_interval: Option<Duration>,
}

impl TunnelSettings {
    pub fn from_config(server: &ServerConfig, transport: &TransportConfig) -> Self {
        Self {
            url: server.connect_url(),
            token: server.token.clone(),
            reconnect_interval: transport.reconnect_interval(),
            heartbeat_interval: transport.heartbeat_interval(),
        }
    }
}

/// Owns the physical connection and its replacement on failure.
pub struct Tunnel {
    settings: TunnelSettings,
    outbound: Outbound,
    requests: mpsc::Sender<Request>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<TransportStats>,
}

impl Tunnel {
    pub fn new(settings: TunnelSettings, outbound: Outbound, requests: mpsc::Sender<Request>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            outbound,
            requests,
            state,
            stats: Arc::new(TransportStats::default()),
        }
    }

    /// Subscribe to state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the tunnel task. Runs until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Main loop: connect, serve the connection, reconnect on failure.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let Some(ws) = self.reconnect(&shutdown).await else {
                break;
            };
            self.state.send_replace(ConnectionState::Connected);

            let (sink, reader) = ws.split();
            let connection = shutdown.child_token();
            let writer = tokio::spawn(write_loop(
                sink,
                self.outbound.clone(),
                Arc::clone(&self.stats),
                self.settings.heartbeat_interval,
                connection.clone(),
            ));

            self.read_loop(reader, &connection).await;

            // Stop the writer before anything dials a replacement connection.
            connection.cancel();
            if let Err(e) = writer.await {
                error!("Tunnel: writer task failed: {e}");
            }
            self.state.send_replace(ConnectionState::Disconnected);

            if shutdown.is_cancelled() {
                break;
            }
            let reconnects = self.stats.reconnects.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(reconnects, "Tunnel: connection lost, reconnecting");
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!("Tunnel: stopped");
    }

    /// Dial once, then every `reconnect_interval` until connected.
    /// Returns `None` only when shut down.
    async fn reconnect(&self, shutdown: &CancellationToken) -> Option<WsStream> {
        self.state.send_replace(ConnectionState::Connecting);
        let interval = self.settings.reconnect_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut first = true;

        loop {
            if !first {
                tokio::select! {
                    () = shutdown.cancelled() => return None,
                    _ = ticker.tick() => {}
                }
            }
            first = false;

            let attempt = tokio::select! {
                () = shutdown.cancelled() => return None,
                result = self.connect() => result,
            };
            match attempt {
                Ok(ws) => return Some(ws),
                Err(e) => warn!(
                    "Tunnel: connect to {} failed: {e}, retrying in {}s",
                    self.settings.url,
                    interval.as_secs_f32()
                ),
            }
        }
    }

    /// A single dial attempt with the token header attached.
    async fn connect(&self) -> crate::Result<WsStream> {
        info!("Tunnel: connecting to {}", self.settings.url);
        let mut request = self
            .settings
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| crate::Error::InvalidUrl(e.to_string()))?;
        request
            .headers_mut()
            .insert(TOKEN_HEADER, HeaderValue::from_str(&self.settings.token)?);

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        info!("Tunnel: connected to {}", self.settings.url);
        Ok(ws)
    }

    /// Receive frames until the connection breaks or is cancelled.
    async fn read_loop(&self, mut reader: WsReader, connection: &CancellationToken) {
        loop {
            let msg = tokio::select! {
                () = connection.cancelled() => return,
                msg = reader.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => self.handle_frame(text.as_bytes()).await,
                Some(Ok(Message::Binary(bytes))) => self.handle_frame(&bytes).await,
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Tunnel: server closed the connection");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Tunnel: read failed: {e}");
                    return;
                }
                None => {
                    info!("Tunnel: connection ended");
                    return;
                }
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let request: Request = match serde_json::from_slice(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "Tunnel: skipping undecodable frame: {e}: {}",
                    String::from_utf8_lossy(bytes)
                );
                return;
            }
        };
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        debug!(
            resource = %request.resource,
            action = %request.action,
            request_id = %request.request_id,
            "Tunnel: request received"
        );
        if self.requests.send(request).await.is_err() {
            warn!("Tunnel: dispatcher is gone, request dropped");
        }
    }
}

/// Drain the outbound queue onto this connection's sink.
async fn write_loop(
    mut sink: WsSink,
    outbound: Outbound,
    stats: Arc<TransportStats>,
    heartbeat: Option<Duration>,
    connection: CancellationToken,
) {
    let mut heartbeat = heartbeat.map(|d| tokio::time::interval_at(Instant::now() + d, d));

    loop {
        tokio::select! {
            () = connection.cancelled() => break,
            envelope = outbound.recv() => {
                let text = match serde_json::to_string(&envelope) {
                    Ok(t) => t,
                    Err(e) => {
                        error!("Tunnel: failed to serialize envelope: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    stats.failed_sends.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        res_type = ?envelope.res_type,
                        request_id = %envelope.request_id,
                        "Tunnel: write failed, envelope dropped: {e}"
                    );
                    connection.cancel();
                    break;
                }
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            () = next_heartbeat(&mut heartbeat) => {
                if let Err(e) = sink.send(Message::Ping(Vec::<u8>::new().into())).await {
                    warn!("Tunnel: heartbeat failed: {e}");
                    connection.cancel();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Response};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
    };

    type ServerWs = WebSocketStream<TcpStream>;

    /// In-process control server; yields each accepted connection with the
    /// token header it presented.
    async fn spawn_server() -> (String, UnboundedReceiver<(ServerWs, Option<String>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let mut token = None;
                let accepted = tokio_tungstenite::accept_hdr_async(
                    tcp,
                    |req: &HandshakeRequest, resp: HandshakeResponse| {
                        token = req
                            .headers()
                            .get(TOKEN_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        Ok::<_, ErrorResponse>(resp)
                    },
                )
                .await;
                let Ok(ws) = accepted else { continue };
                if tx.send((ws, token)).is_err() {
                    break;
                }
            }
        });
        (format!("ws://{addr}/osp/kube/connect"), rx)
    }

    /// Stand-in dispatcher: answers every request with `Success`.
    fn spawn_echo_dispatcher(mut requests: mpsc::Receiver<Request>, outbound: Outbound) {
        tokio::spawn(async move {
            while let Some(req) = requests.recv().await {
                outbound.send(Envelope::response(req.request_id, &Response::ok()));
            }
        });
    }

    fn start_tunnel(url: String) -> (watch::Receiver<ConnectionState>, Arc<TransportStats>, CancellationToken) {
        start_tunnel_with(url, Outbound::new(64))
    }

    fn start_tunnel_with(
        url: String,
        outbound: Outbound,
    ) -> (watch::Receiver<ConnectionState>, Arc<TransportStats>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        spawn_echo_dispatcher(rx, outbound.clone());
        let tunnel = Tunnel::new(
            TunnelSettings {
                url,
                token: "secret-token".to_string(),
                reconnect_interval: Duration::from_millis(100),
                heartbeat_interval: None,
            },
            outbound,
            tx,
        );
        let state = tunnel.state();
        let stats = tunnel.stats();
        let shutdown = CancellationToken::new();
        tunnel.spawn(shutdown.clone());
        (state, stats, shutdown)
    }

    async fn request(ws: &mut ServerWs, id: &str) -> Envelope {
        let frame = serde_json::json!({"resource": "pod", "action": "list", "request_id": id, "params": {}});
        ws.send(Message::text(frame.to_string())).await.unwrap();
        read_envelope(ws).await
    }

    async fn read_envelope(ws: &mut ServerWs) -> Envelope {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn accept(rx: &mut UnboundedReceiver<(ServerWs, Option<String>)>) -> (ServerWs, Option<String>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("agent did not connect")
            .unwrap()
    }

    #[tokio::test]
    async fn sends_token_header_and_correlates_responses() {
        let (url, mut conns) = spawn_server().await;
        let (_state, stats, shutdown) = start_tunnel(url);

        let (mut ws, token) = accept(&mut conns).await;
        assert_eq!(token.as_deref(), Some("secret-token"));

        let env = request(&mut ws, "r1").await;
        assert_eq!(env.request_id, "r1");
        assert!(env.response_payload().unwrap().is_success());
        assert_eq!(stats.messages_received.load(Ordering::Relaxed), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_frame_does_not_drop_the_connection() {
        let (url, mut conns) = spawn_server().await;
        let (_state, stats, shutdown) = start_tunnel(url);

        let (mut ws, _) = accept(&mut conns).await;
        ws.send(Message::text("{not json")).await.unwrap();
        let env = request(&mut ws, "after-garbage").await;
        assert_eq!(env.request_id, "after-garbage");
        assert_eq!(stats.reconnects.load(Ordering::Relaxed), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn reconnects_within_one_interval_and_keeps_serving() {
        let (url, mut conns) = spawn_server().await;
        let (mut state, stats, shutdown) = start_tunnel(url);

        let (mut first, _) = accept(&mut conns).await;
        assert_eq!(request(&mut first, "before").await.request_id, "before");
        drop(first);

        // Immediate retry, so well inside one 100 ms interval plus slack.
        let (mut second, token) = accept(&mut conns).await;
        assert_eq!(token.as_deref(), Some("secret-token"));
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        let env = request(&mut second, "after").await;
        assert_eq!(env.request_id, "after");
        assert!(stats.reconnects.load(Ordering::Relaxed) >= 1);
        shutdown.cancel();
    }

    async fn accept_on(listener: &TcpListener) -> ServerWs {
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("agent did not connect")
            .unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    async fn wait_for_state(state: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    /// Connect once, then take the server away so the tunnel sits in
    /// `Connecting` with nothing draining the queue.
    async fn disconnected_tunnel(
        outbound: &Outbound,
    ) -> (std::net::SocketAddr, watch::Receiver<ConnectionState>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut state, _stats, shutdown) =
            start_tunnel_with(format!("ws://{addr}/osp/kube/connect"), outbound.clone());

        let first = accept_on(&listener).await;
        wait_for_state(&mut state, ConnectionState::Connected).await;
        drop(listener);
        drop(first);
        wait_for_state(&mut state, ConnectionState::Connecting).await;
        (addr, state, shutdown)
    }

    #[tokio::test]
    async fn envelopes_queued_while_disconnected_arrive_in_order_after_reconnect() {
        let outbound = Outbound::new(64);
        let (addr, mut state, shutdown) = disconnected_tunnel(&outbound).await;

        for id in ["q1", "q2", "q3"] {
            outbound.send(Envelope::response(id, &Response::ok()));
        }
        assert_eq!(outbound.len(), 3);

        let listener = TcpListener::bind(addr).await.unwrap();
        let mut ws = accept_on(&listener).await;
        wait_for_state(&mut state, ConnectionState::Connected).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(read_envelope(&mut ws).await.request_id);
        }
        assert_eq!(ids, ["q1", "q2", "q3"]);
        assert_eq!(outbound.dropped(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn overflow_while_disconnected_keeps_only_the_newest() {
        let outbound = Outbound::new(3);
        let (addr, mut state, shutdown) = disconnected_tunnel(&outbound).await;

        for id in ["q0", "q1", "q2", "q3", "q4"] {
            outbound.send(Envelope::response(id, &Response::ok()));
        }
        assert_eq!(outbound.dropped(), 2);

        let listener = TcpListener::bind(addr).await.unwrap();
        let mut ws = accept_on(&listener).await;
        wait_for_state(&mut state, ConnectionState::Connected).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(read_envelope(&mut ws).await.request_id);
        }
        assert_eq!(ids, ["q2", "q3", "q4"]);
        // Nothing else was left queued ahead of fresh traffic.
        assert_eq!(request(&mut ws, "after").await.request_id, "after");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn retries_until_the_server_appears() {
        // Reserve a port, then free it so the first dials are refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut state, _stats, shutdown) = start_tunnel(format!("ws://{addr}/osp/kube/connect"));
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == ConnectionState::Connecting))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_ne!(*state.borrow(), ConnectionState::Connected);

        let listener = TcpListener::bind(addr).await.unwrap();
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let _ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();
        shutdown.cancel();
    }
}
