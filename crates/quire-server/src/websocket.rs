//! WebSocket live reload.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::sync::broadcast;

/// Messages pushed to connected pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMessage {
    /// A build finished; reload the page
    Rebuild,
}

impl ReloadMessage {
    /// Text sent over the socket.
    pub fn as_str(self) -> &'static str {
        match self {
            ReloadMessage::Rebuild => "rebuild",
        }
    }
}

/// Hub for broadcasting reload messages to all connected pages.
#[derive(Debug, Clone)]
pub struct LiveReloadHub {
    sender: broadcast::Sender<ReloadMessage>,
}

impl LiveReloadHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Send a message to every connection. Returns how many received it.
    pub fn send(&self, msg: ReloadMessage) -> usize {
        // No receivers just means no page is open
        self.sender.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadMessage> {
        self.sender.subscribe()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Router accepting live-reload connections at `/`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .with_state(self.clone())
    }
}

impl Default for LiveReloadHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(hub): State<LiveReloadHub>,
) -> impl IntoResponse {
    tracing::debug!("Live reload connection from {}", peer);
    ws.on_upgrade(move |socket| handle_ws(socket, hub))
}

async fn handle_ws(mut socket: WebSocket, hub: LiveReloadHub) {
    let mut rx = hub.subscribe();

    loop {
        match rx.recv().await {
            Ok(msg) => {
                if socket.send(Message::Text(msg.as_str().into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
