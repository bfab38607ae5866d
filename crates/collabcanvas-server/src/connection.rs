//! One client WebSocket connection.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use collabcanvas_core::protocol::{ClientMessage, RequestId, ServerMessage};
use collabcanvas_core::{ClientId, MemoryRoom, PresenceCollection, RemoteResult, ShapeCollection};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn request_id_of(msg: &ClientMessage) -> Option<RequestId> {
    match msg {
        ClientMessage::SetShape { request_id, .. }
        | ClientMessage::SetShapes { request_id, .. }
        | ClientMessage::DeleteShape { request_id, .. }
        | ClientMessage::WriteSnapshot { request_id, .. }
        | ClientMessage::ReadSnapshot { request_id } => Some(*request_id),
        _ => None,
    }
}

struct Connection {
    id: String,
    state: Arc<AppState>,
    out: mpsc::UnboundedSender<ServerMessage>,
    joined: Option<(String, Arc<MemoryRoom>)>,
    /// Presence record to drop if the socket goes away without leaving.
    presence_client: Option<ClientId>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Connection {
    fn reply(&self, msg: ServerMessage) {
        let _ = self.out.send(msg);
    }

    fn ack(&self, request_id: RequestId, result: RemoteResult<()>) {
        match result {
            Ok(()) => self.reply(ServerMessage::Ack { request_id }),
            Err(e) => {
                warn!("Request {} from {} failed: {}", request_id, self.id, e);
                self.reply(ServerMessage::Error {
                    request_id: Some(request_id),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Forward a subscription into this connection's outbox until either side ends.
    fn forward<T: Send + 'static>(
        &mut self,
        mut feed: mpsc::UnboundedReceiver<T>,
        wrap: impl Fn(T) -> ServerMessage + Send + 'static,
    ) {
        let out = self.out.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(item) = feed.recv().await {
                if out.send(wrap(item)).is_err() {
                    break;
                }
            }
        }));
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                warn!("Invalid message from {}: {}", self.id, e);
                self.reply(ServerMessage::Error {
                    request_id: None,
                    message: format!("Invalid message: {}", e),
                });
            }
        }
    }

    async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::Join { room, client_id } => self.join(room, client_id).await,
            other => self.handle_in_room(other).await,
        }
    }

    async fn handle_in_room(&mut self, msg: ClientMessage) {
        let Some((_, room)) = &self.joined else {
            self.reply(ServerMessage::Error {
                request_id: request_id_of(&msg),
                message: "Join a room first".to_string(),
            });
            return;
        };
        let room = room.clone();

        match msg {
            ClientMessage::Join { .. } => {}
            ClientMessage::SetShape { request_id, id, fields } => {
                debug!("{} set {}", self.id, id);
                self.ack(request_id, room.set_shape(&id, fields).await);
            }
            ClientMessage::SetShapes { request_id, docs } => {
                debug!("{} set {} shapes", self.id, docs.len());
                let docs = docs.into_iter().map(|d| (d.id, d.fields)).collect();
                self.ack(request_id, room.set_shapes(docs).await);
            }
            ClientMessage::DeleteShape { request_id, id } => {
                debug!("{} delete {}", self.id, id);
                self.ack(request_id, room.delete_shape(&id).await);
            }
            ClientMessage::SubscribeShapes => match room.subscribe_shapes().await {
                Ok(feed) => self.forward(feed, |batch| ServerMessage::Shapes { batch }),
                Err(e) => self.reply(ServerMessage::Error {
                    request_id: None,
                    message: e.to_string(),
                }),
            },
            ClientMessage::Heartbeat { record } => {
                self.presence_client = Some(record.client_id.clone());
                if let Err(e) = room.heartbeat(record).await {
                    warn!("Heartbeat from {} failed: {}", self.id, e);
                }
            }
            ClientMessage::LeavePresence { client_id } => {
                if self.presence_client.as_deref() == Some(client_id.as_str()) {
                    self.presence_client = None;
                }
                if let Err(e) = room.leave(&client_id).await {
                    warn!("Presence leave from {} failed: {}", self.id, e);
                }
            }
            ClientMessage::SubscribePresence => match room.subscribe_presence().await {
                Ok(feed) => self.forward(feed, |records| ServerMessage::Presence { records }),
                Err(e) => self.reply(ServerMessage::Error {
                    request_id: None,
                    message: e.to_string(),
                }),
            },
            ClientMessage::WriteSnapshot { request_id, snapshot } => {
                self.ack(request_id, room.write_snapshot(snapshot).await);
            }
            ClientMessage::ReadSnapshot { request_id } => match room.read_snapshot().await {
                Ok(snapshot) => self.reply(ServerMessage::Snapshot { request_id, snapshot }),
                Err(e) => self.reply(ServerMessage::Error {
                    request_id: Some(request_id),
                    message: e.to_string(),
                }),
            },
        }
    }

    async fn join(&mut self, room_id: String, client_id: ClientId) {
        self.close().await;
        let (room, client_count) = self.state.join_room(&room_id);
        info!("Client {} ({}) joined room {}", client_id, self.id, room_id);
        self.joined = Some((room_id.clone(), room));
        self.reply(ServerMessage::Joined {
            room: room_id,
            client_count,
        });
    }

    /// Stop subscriptions and leave the current room, if any.
    async fn close(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        if let Some((room_id, room)) = self.joined.take() {
            self.state.leave_room(&room_id);
            if let Some(client_id) = self.presence_client.take() {
                if let Err(e) = room.leave(&client_id).await {
                    warn!("Presence cleanup for {} failed: {}", client_id, e);
                }
            }
            info!("Connection {} left room {}", self.id, room_id);
        }
    }
}

/// Serve one socket until it closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let id = Uuid::new_v4().to_string();
    info!("New connection: {}", id);

    let (mut sender, mut receiver) = socket.split();
    let (out, mut outbox) = mpsc::unbounded_channel::<ServerMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbox.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Could not encode server message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        id: id.clone(),
        state,
        out,
        joined: None,
        presence_client: None,
        forwarders: Vec::new(),
    };
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => conn.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket error for {}: {}", id, e);
                break;
            }
        }
    }

    conn.close().await;
    drop(conn);
    if let Err(e) = send_task.await {
        warn!("Send task for {} failed: {}", id, e);
    }
    info!("Connection closed: {}", id);
}
