//! WebSocket transport. The privileged process serves `/ws` (one envelope
//! per text frame) and `/health`; the crawler side connects with
//! [`WsChannel`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use lore_core::errors::BridgeError;
use lore_settings::BridgeSettings;

use crate::channel::Channel;
use crate::envelope::{Envelope, Reply};
use crate::host::Host;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct WsConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self::from(&BridgeSettings::default())
    }
}

impl From<&BridgeSettings> for WsConfig {
    fn from(s: &BridgeSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone)]
struct AppState {
    host: Arc<Host>,
    connections: Arc<DashMap<u64, SocketAddr>>,
    next_conn: Arc<AtomicU64>,
    max_send_queue: usize,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Keeps the server task alive; the server stops when `cancel` fires.
pub struct ServerHandle {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

pub async fn serve(
    host: Arc<Host>,
    config: &WsConfig,
    cancel: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        host,
        connections: Arc::new(DashMap::new()),
        next_conn: Arc::new(AtomicU64::new(1)),
        max_send_queue: config.max_send_queue.max(1),
    };
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "bridge host listening");

    let router = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let task = tokio::spawn(async move {
        let shutdown = cancel.cancelled_owned();
        if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            warn!(error = %e, "bridge host stopped with error");
        }
        info!("bridge host stopped");
    });
    Ok(ServerHandle { addr, task })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    axum::extract::ConnectInfo(peer): axum::extract::ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.host.index().get_stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "eventCount": stats.event_count,
                "roomCount": stats.room_count,
                "connections": state.connections.len(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unhealthy", "error": e.to_string() })),
        ),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: SocketAddr) {
    let conn_id = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let _ = state.connections.insert(conn_id, peer);
    info!(conn_id, %peer, "bridge client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.max_send_queue);

    // Writer: replies out plus a periodic ping.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(conn_id, "sent ping");
                }
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => {
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(env) => env,
                    Err(e) => {
                        let reply = Reply::err(None, &BridgeError::Codec(format!("bad envelope: {e}")));
                        send_reply(&out_tx, &reply).await;
                        continue;
                    }
                };
                let host = Arc::clone(&state.host);
                let out_tx = out_tx.clone();
                drop(tokio::spawn(async move {
                    let reply = host.handle(envelope).await;
                    send_reply(&out_tx, &reply).await;
                }));
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    drop(out_tx);
    let _ = writer.await;
    let _ = state.connections.remove(&conn_id);
    info!(conn_id, "bridge client disconnected");
}

async fn send_reply(out: &mpsc::Sender<String>, reply: &Reply) {
    match serde_json::to_string(reply) {
        Ok(json) => {
            if out.send(json).await.is_err() {
                debug!(id = ?reply.id, "connection closed before reply");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode reply"),
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Outgoing {
    envelope: Envelope,
    reply: oneshot::Sender<Reply>,
}

/// Client end of the WebSocket transport. Requests get connection-unique
/// ids on the wire; replies are matched back by id.
pub struct WsChannel {
    cmd_tx: mpsc::Sender<Outgoing>,
    _handler: JoinHandle<()>,
}

impl WsChannel {
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| BridgeError::ChannelUnavailable(format!("connect {url}: {e}")))?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handler = tokio::spawn(client_loop(ws, cmd_rx));
        info!(url, "connected to bridge host");
        Ok(Self {
            cmd_tx,
            _handler: handler,
        })
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn call(&self, envelope: Envelope) -> Result<Reply, BridgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Outgoing {
                envelope,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BridgeError::ChannelUnavailable("websocket closed".into()))?;
        reply_rx
            .await
            .map_err(|_| BridgeError::ChannelUnavailable("websocket closed before reply".into()))
    }
}

async fn client_loop(ws: WsStream, mut cmd_rx: mpsc::Receiver<Outgoing>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, (Option<u64>, oneshot::Sender<Reply>)> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(Outgoing { mut envelope, reply }) = cmd else { break };
                let wire_id = next_id;
                next_id += 1;
                let caller_id = envelope.id.replace(wire_id);
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        let _ = reply.send(Reply::err(caller_id, &BridgeError::Codec(e.to_string())));
                        continue;
                    }
                };
                let _ = pending.insert(wire_id, (caller_id, reply));
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(mut reply) = serde_json::from_str::<Reply>(text.as_str()) else {
                    warn!("unparseable reply from bridge host");
                    continue;
                };
                let Some(wire_id) = reply.id else {
                    warn!(error = ?reply.error, "bridge host rejected a frame");
                    continue;
                };
                if let Some((caller_id, tx)) = pending.remove(&wire_id) {
                    reply.id = caller_id;
                    let _ = tx.send(reply);
                }
            }
        }
    }
    debug!(pending = pending.len(), "bridge connection closed");
}

#[cfg(test)]
mod tests {
    use lore_core::checkpoint::Checkpoint;
    use lore_core::ids::RoomId;
    use lore_core::index::{CheckpointStore, EventIndex};

    use super::*;
    use crate::channel::BridgeClient;
    use crate::host::test_host;
    use crate::proxy::IndexProxy;

    async fn start() -> (ServerHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        let config = WsConfig {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 32,
        };
        let handle = serve(Arc::new(test_host()), &config, cancel.clone()).await.unwrap();
        (handle, cancel)
    }

    #[tokio::test]
    async fn proxy_over_websocket() {
        let (handle, cancel) = start().await;
        let channel = WsChannel::connect(&format!("ws://{}/ws", handle.addr)).await.unwrap();
        let proxy = IndexProxy::new(BridgeClient::new(Arc::new(channel), Duration::from_secs(5)));

        let cp = Checkpoint::backward(RoomId::from_raw("!r:localhost"), "t0");
        proxy.add_checkpoint(&cp).await.unwrap();
        let err = proxy.add_checkpoint(&cp).await.unwrap_err();
        assert_eq!(err, BridgeError::DuplicateCheckpoint(cp.key()));
        assert_eq!(proxy.load_checkpoints().await.unwrap(), vec![cp]);
        assert!(proxy.supports_event_indexing().await.unwrap());

        drop(proxy);
        cancel.cancel();
        handle.wait().await;
    }

    #[tokio::test]
    async fn concurrent_calls_are_matched_by_id() {
        let (handle, cancel) = start().await;
        let channel = WsChannel::connect(&format!("ws://{}/ws", handle.addr)).await.unwrap();
        let proxy = Arc::new(IndexProxy::new(BridgeClient::new(
            Arc::new(channel),
            Duration::from_secs(5),
        )));

        let mut tasks = tokio::task::JoinSet::new();
        for n in 1..=8u32 {
            let proxy = Arc::clone(&proxy);
            tasks.spawn(async move {
                let owner = RoomId::from_raw(format!("!r{n}:localhost"));
                proxy
                    .add_checkpoint(&Checkpoint::backward(owner, format!("t{n}")))
                    .await
            });
        }
        while let Some(done) = tasks.join_next().await {
            done.unwrap().unwrap();
        }
        assert_eq!(proxy.load_checkpoints().await.unwrap().len(), 8);

        drop(proxy);
        cancel.cancel();
        handle.wait().await;
    }

    #[tokio::test]
    async fn health_reports_index_stats() {
        let (handle, cancel) = start().await;
        let body: serde_json::Value = reqwest::get(format!("http://{}/health", handle.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["eventCount"], 0);

        cancel.cancel();
        handle.wait().await;
    }

    #[tokio::test]
    async fn malformed_frame_gets_invalid_params() {
        let (handle, cancel) = start().await;
        let (mut ws, _) = connect_async(format!("ws://{}/ws", handle.addr)).await.unwrap();
        ws.send(Message::Text("not json".into())).await.unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break serde_json::from_str::<Reply>(text.as_str()).unwrap(),
                _ => continue,
            }
        };
        assert!(!reply.success);
        assert_eq!(reply.id, None);
        assert_eq!(reply.error.unwrap().code, "INVALID_PARAMS");

        drop(ws);
        cancel.cancel();
        handle.wait().await;
    }

    #[tokio::test]
    async fn connect_to_nothing_is_unavailable() {
        let err = WsChannel::connect("ws://127.0.0.1:1/ws").await.err().unwrap();
        assert!(matches!(err, BridgeError::ChannelUnavailable(_)));
    }
}
