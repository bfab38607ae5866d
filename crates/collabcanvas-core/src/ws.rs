//! WebSocket client for a relay-hosted room.
//!
//! [`WsRoom`] implements both remote collection traits over one connection.
//! A writer task owns the sink and a reader task dispatches server frames:
//! acknowledgements complete the matching request, subscription frames fan
//! out to the local subscribers.

use crate::error::{RemoteError, RemoteResult};
use crate::presence::PresenceRecord;
use crate::protocol::{ClientMessage, RequestId, ServerMessage, ShapeDoc};
use crate::remote::{
    BoxFuture, DocFields, FeedBatch, PresenceCollection, PresenceFeed, ShapeCollection, ShapeFeed,
    SnapshotDocument,
};
use crate::shapes::ShapeId;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

enum Reply {
    Ack,
    Snapshot(Option<SnapshotDocument>),
}

type PendingReply = oneshot::Sender<RemoteResult<Reply>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Shared {
    next_request: AtomicU64,
    connected: AtomicBool,
    pending: Mutex<HashMap<RequestId, PendingReply>>,
    shape_subscribers: Mutex<Vec<mpsc::UnboundedSender<FeedBatch>>>,
    presence_subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<PresenceRecord>>>>,
}

impl Shared {
    fn complete(&self, request_id: RequestId, reply: RemoteResult<Reply>) {
        match lock(&self.pending).remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::debug!("Reply for unknown request {}", request_id),
        }
    }

    fn dispatch(&self, text: &str) {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring malformed server frame: {}", e);
                return;
            }
        };
        match msg {
            ServerMessage::Joined { room, client_count } => {
                log::info!("Joined room {} ({} clients)", room, client_count);
            }
            ServerMessage::Ack { request_id } => self.complete(request_id, Ok(Reply::Ack)),
            ServerMessage::Snapshot { request_id, snapshot } => {
                self.complete(request_id, Ok(Reply::Snapshot(snapshot)))
            }
            ServerMessage::Error {
                request_id: Some(request_id),
                message,
            } => self.complete(request_id, Err(RemoteError::Rejected(message))),
            ServerMessage::Error {
                request_id: None,
                message,
            } => log::warn!("Server error: {}", message),
            ServerMessage::Shapes { batch } => {
                lock(&self.shape_subscribers).retain(|tx| tx.send(batch.clone()).is_ok());
            }
            ServerMessage::Presence { records } => {
                lock(&self.presence_subscribers).retain(|tx| tx.send(records.clone()).is_ok());
            }
        }
    }

    /// Fail everything in flight and end all feeds.
    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        for (_, tx) in lock(&self.pending).drain() {
            let _ = tx.send(Err(RemoteError::Disconnected));
        }
        lock(&self.shape_subscribers).clear();
        lock(&self.presence_subscribers).clear();
    }
}

/// A room reached through the relay server.
pub struct WsRoom {
    outgoing: mpsc::UnboundedSender<String>,
    shared: Arc<Shared>,
}

impl WsRoom {
    /// Connect to `url` and join `room` as `client_id`.
    pub async fn connect(url: &str, room: &str, client_id: &str) -> RemoteResult<Self> {
        let parsed = Url::parse(url).map_err(|e| RemoteError::Transport(format!("Invalid URL: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(RemoteError::Transport(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed.scheme()
            )));
        }

        let (stream, response) = tokio_tungstenite::connect_async(parsed.as_str())
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        log::info!("WebSocket connected to {}, status: {}", parsed, response.status());

        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    log::warn!("WebSocket send error: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = shared.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.dispatch(text.as_str()),
                    Ok(Message::Close(_)) => {
                        log::info!("WebSocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
            reader.disconnect();
        });

        let ws = Self { outgoing, shared };
        ws.send(&ClientMessage::Join {
            room: room.to_string(),
            client_id: client_id.to_string(),
        })?;
        Ok(ws)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&self, msg: &ClientMessage) -> RemoteResult<()> {
        if !self.is_connected() {
            return Err(RemoteError::Disconnected);
        }
        let text = msg.to_json()?;
        self.outgoing.send(text).map_err(|_| RemoteError::Disconnected)
    }

    async fn request(&self, build: impl FnOnce(RequestId) -> ClientMessage) -> RemoteResult<Reply> {
        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, tx);
        if let Err(e) = self.send(&build(request_id)) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e);
        }
        rx.await.map_err(|_| RemoteError::Disconnected)?
    }

    async fn write(&self, build: impl FnOnce(RequestId) -> ClientMessage) -> RemoteResult<()> {
        self.request(build).await.map(|_| ())
    }
}

impl ShapeCollection for WsRoom {
    fn set_shape(&self, id: &str, fields: DocFields) -> BoxFuture<'_, RemoteResult<()>> {
        let id = id.to_string();
        Box::pin(self.write(move |request_id| ClientMessage::SetShape { request_id, id, fields }))
    }

    fn set_shapes(&self, docs: Vec<(ShapeId, DocFields)>) -> BoxFuture<'_, RemoteResult<()>> {
        let docs = docs.into_iter().map(|(id, fields)| ShapeDoc { id, fields }).collect();
        Box::pin(self.write(move |request_id| ClientMessage::SetShapes { request_id, docs }))
    }

    fn delete_shape(&self, id: &str) -> BoxFuture<'_, RemoteResult<()>> {
        let id = id.to_string();
        Box::pin(self.write(move |request_id| ClientMessage::DeleteShape { request_id, id }))
    }

    fn subscribe_shapes(&self) -> BoxFuture<'_, RemoteResult<ShapeFeed>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&self.shared.shape_subscribers).push(tx);
            self.send(&ClientMessage::SubscribeShapes)?;
            Ok(rx)
        })
    }

    fn write_snapshot(&self, snapshot: SnapshotDocument) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(self.write(move |request_id| ClientMessage::WriteSnapshot { request_id, snapshot }))
    }

    fn read_snapshot(&self) -> BoxFuture<'_, RemoteResult<Option<SnapshotDocument>>> {
        Box::pin(async move {
            match self.request(|request_id| ClientMessage::ReadSnapshot { request_id }).await? {
                Reply::Snapshot(snapshot) => Ok(snapshot),
                Reply::Ack => Ok(None),
            }
        })
    }
}

impl PresenceCollection for WsRoom {
    fn heartbeat(&self, record: PresenceRecord) -> BoxFuture<'_, RemoteResult<()>> {
        Box::pin(async move { self.send(&ClientMessage::Heartbeat { record }) })
    }

    fn leave(&self, client_id: &str) -> BoxFuture<'_, RemoteResult<()>> {
        let client_id = client_id.to_string();
        Box::pin(async move { self.send(&ClientMessage::LeavePresence { client_id }) })
    }

    fn subscribe_presence(&self) -> BoxFuture<'_, RemoteResult<PresenceFeed>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            lock(&self.shared.presence_subscribers).push(tx);
            self.send(&ClientMessage::SubscribePresence)?;
            Ok(rx)
        })
    }
}
