//! WebSocket fan-out relay.
//!
//! Browser clients attach to a topic via `GET /ws?topic=<t>`; guests push
//! frames at them through the `ws_broadcast` host function. Each client owns
//! a bounded outbound queue drained by a writer task; a full queue drops
//! that client's copy of a message without disconnecting it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;

struct ClientHandle {
    tx: mpsc::Sender<Vec<u8>>,
}

struct RelayInner {
    clients: RwLock<HashMap<String, HashMap<u64, ClientHandle>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    write_timeout: Duration,
}

/// Topic-keyed WebSocket client registry. Cheap to clone.
#[derive(Clone)]
pub struct WsRelay {
    inner: Arc<RelayInner>,
}

impl WsRelay {
    pub fn new(queue_capacity: usize, write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                clients: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                queue_capacity,
                write_timeout,
            }),
        }
    }

    /// Enqueues `payload` to every client on `topic`, non-blocking. Clients
    /// with a full queue miss this message but stay connected. A topic with
    /// no clients is a no-op.
    pub fn broadcast(&self, topic: &str, payload: &[u8]) {
        let clients = self.inner.clients.read();
        let Some(set) = clients.get(topic) else {
            return;
        };
        for client in set.values() {
            let _ = client.tx.try_send(payload.to_vec());
        }
    }

    /// Number of clients currently attached to `topic`.
    pub fn client_count(&self, topic: &str) -> usize {
        self.inner
            .clients
            .read()
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// The `/ws` route, ready to merge into the host's router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.clone())
    }

    fn register(&self, topic: &str) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .clients
            .write()
            .entry(topic.to_string())
            .or_default()
            .insert(id, ClientHandle { tx });
        (id, rx)
    }

    fn unregister(&self, topic: &str, id: u64) {
        let mut clients = self.inner.clients.write();
        if let Some(set) = clients.get_mut(topic) {
            set.remove(&id);
            if set.is_empty() {
                clients.remove(topic);
            }
        }
    }
}

#[derive(Deserialize)]
struct WsParams {
    topic: Option<String>,
}

async fn ws_handler(
    State(relay): State<WsRelay>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(topic) = params.topic.filter(|t| !t.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "topic required").into_response();
    };
    ws.on_upgrade(move |socket| client_loop(relay, topic, socket))
}

async fn client_loop(relay: WsRelay, topic: String, socket: WebSocket) {
    let (id, mut rx) = relay.register(&topic);
    tracing::debug!(topic = %topic, client = id, "websocket client attached");

    let write_timeout = relay.inner.write_timeout;
    let (mut sink, mut stream) = socket.split();

    // Writer drains the bounded queue into binary frames. A failed or
    // timed-out write terminates the writer and closes the socket.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let send = sink.send(WsMessage::Binary(payload.into()));
            match tokio::time::timeout(write_timeout, send).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
        let _ = sink.close().await;
    });

    // Read loop exists solely to observe close frames; data frames are
    // discarded.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    relay.unregister(&topic, id);
    writer.abort();
    tracing::debug!(topic = %topic, client = id, "websocket client detached");
}
