//! CollabCanvas WebSocket Room Server
//!
//! Hosts one in-memory room per room id. A room holds the shape collection,
//! the presence collection, and the snapshot document; clients read and
//! write them with the JSON protocol in `collabcanvas_core::protocol`:
//!
//! ```json
//! { "type": "join", "room": "lobby", "client_id": "c1" }
//! { "type": "set_shape", "request_id": 1, "id": "c1-1", "fields": { "type": "rectangle", "x": 10 } }
//! { "type": "subscribe_shapes" }
//! ```
//!
//! Writes are acknowledged with `ack` or `error` carrying the request id.
//! A client's presence record is removed when its socket closes.

mod config;
mod connection;
mod state;

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use collabcanvas_core::SystemClock;
use config::ServerConfig;
use state::AppState;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collabcanvas_server=info,collabcanvas_core=info,tower_http=info".into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::new(Arc::new(SystemClock)));
    let listener = match tokio::net::TcpListener::bind(config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not bind {}: {}", config.addr, e);
            std::process::exit(1);
        }
    };
    info!("CollabCanvas server listening on {}", config.addr);
    info!("WebSocket endpoint: ws://{}/ws", config.addr);

    if let Err(e) = axum::serve(listener, router(state)).await {
        error!("Server error: {}", e);
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    "CollabCanvas Server - Connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use collabcanvas_core::remote::{shape_from_fields, shape_to_fields};
    use collabcanvas_core::{
        CanvasDocument, LockField, PresenceCollection, PresenceRecord, Shape, ShapeCollection,
        SnapshotDocument, WsRoom,
    };
    use kurbo::Point;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn serve() -> (String, Arc<AppState>) {
        let state = Arc::new(AppState::new(Arc::new(SystemClock)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{}/ws", addr), state)
    }

    #[tokio::test]
    async fn test_writes_reach_other_clients() {
        let (url, state) = serve().await;
        let a = WsRoom::connect(&url, "lobby", "a").await.unwrap();
        let b = WsRoom::connect(&url, "lobby", "b").await.unwrap();

        let mut feed = b.subscribe_shapes().await.unwrap();
        let initial = timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
        assert!(initial.initial);
        assert!(initial.changes.is_empty());

        let shape = Shape::rectangle(Point::new(10.0, 10.0), 20.0, 20.0).with_id("r");
        a.set_shape("r", shape_to_fields(&shape, LockField::Assert)).await.unwrap();

        let batch = timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(shape_from_fields("r", &batch.changes[0].fields), shape);
        assert_eq!(state.client_count("lobby"), 2);

        a.delete_shape("r").await.unwrap();
        assert_eq!(a.read_snapshot().await, Ok(None));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reconnect() {
        let (url, _) = serve().await;
        let mut doc = CanvasDocument::new();
        doc.insert(Shape::circle(Point::new(5.0, 5.0), 8.0).with_id("c"));
        let snapshot = SnapshotDocument::capture(&doc, 42);

        let writer = WsRoom::connect(&url, "lobby", "a").await.unwrap();
        writer.write_snapshot(snapshot.clone()).await.unwrap();
        drop(writer);

        let reader = WsRoom::connect(&url, "lobby", "b").await.unwrap();
        assert_eq!(reader.read_snapshot().await, Ok(Some(snapshot)));
        let other = WsRoom::connect(&url, "elsewhere", "b").await.unwrap();
        assert_eq!(other.read_snapshot().await, Ok(None));
    }

    #[tokio::test]
    async fn test_presence_is_dropped_when_socket_closes() {
        let (url, state) = serve().await;
        let a = WsRoom::connect(&url, "lobby", "a").await.unwrap();
        let b = WsRoom::connect(&url, "lobby", "b").await.unwrap();
        let mut presence = b.subscribe_presence().await.unwrap();

        a.heartbeat(PresenceRecord::new("a", "Ada", "#f00")).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while let Some(records) = presence.recv().await {
                if records.iter().any(|r| r.client_id == "a") {
                    break;
                }
            }
        })
        .await
        .unwrap();

        drop(a);
        timeout(Duration::from_secs(2), async {
            while let Some(records) = presence.recv().await {
                if records.is_empty() {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(state.client_count("lobby"), 1);
    }
}
