//! Broadcast relay for two-party WebRTC signaling.
//!
//! Every new connection bumps the participant count and receives
//! `{"type":"server","clientCount":n}`. Any frame a party sends is forwarded
//! verbatim to every other connected party, never back to the sender.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const DEFAULT_PATH: &str = "/ws";

#[derive(Debug, Serialize)]
struct ParticipantNotice {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "clientCount")]
    client_count: i64,
}

/// Connected parties and the running count.
#[derive(Clone, Default)]
pub struct RelayState {
    peers: Arc<DashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_id: Arc<AtomicU64>,
    client_count: Arc<AtomicI64>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_count(&self) -> i64 {
        self.client_count.load(Ordering::SeqCst)
    }

    pub fn connected(&self) -> usize {
        self.peers.len()
    }

    fn join(&self, tx: mpsc::UnboundedSender<Message>) -> (u64, i64) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let count = self.client_count.fetch_add(1, Ordering::SeqCst) + 1;
        let notice = ParticipantNotice {
            kind: "server",
            client_count: count,
        };
        match serde_json::to_string(&notice) {
            Ok(json) => {
                let _ = tx.send(Message::Text(json));
            }
            Err(err) => warn!(target = "signal_relay", peer = id, error = %err, "failed to encode participant notice"),
        }
        // Registered after the notice is queued, so it always arrives first.
        self.peers.insert(id, tx);
        (id, count)
    }

    fn leave(&self, id: u64) -> i64 {
        self.peers.remove(&id);
        self.client_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Forward to everyone but `from`; returns how many parties got it.
    fn broadcast_except(&self, from: u64, message: Message) -> usize {
        let targets: Vec<mpsc::UnboundedSender<Message>> = self
            .peers
            .iter()
            .filter(|entry| *entry.key() != from)
            .map(|entry| entry.value().clone())
            .collect();
        targets
            .into_iter()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }
}

pub fn router(state: RelayState, path: &str) -> Router {
    Router::new()
        .route(path, get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the relay on an already bound listener until the future is dropped
/// or the listener fails.
pub async fn serve(listener: TcpListener, state: RelayState, path: &str) -> std::io::Result<()> {
    let app = router(state, path);
    axum::serve(listener, app).await
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (id, count) = state.join(tx);
    info!(target = "signal_relay", peer = id, client_count = count, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
        debug!(target = "signal_relay", peer = id, "writer ended");
    });

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                debug!(target = "signal_relay", peer = id, error = %err, "websocket error");
                break;
            }
        };
        match message {
            Message::Text(_) | Message::Binary(_) => {
                let delivered = state.broadcast_except(id, message);
                debug!(target = "signal_relay", peer = id, delivered, "relayed frame");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let remaining = state.leave(id);
    writer.abort();
    info!(target = "signal_relay", peer = id, client_count = remaining, "client disconnected");
}
