use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::entity::UserId;
use crate::error::ChatError;
use crate::interface::ws;
use crate::manager::ChatManager;

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct ServerState {
    pub manager: Arc<ChatManager>,
    pub history_limit: i64,
}

pub struct ChatServer {
    manager: Arc<ChatManager>,
    history_limit: i64,
}

impl ChatServer {
    pub fn new(manager: Arc<ChatManager>, history_limit: i64) -> Self {
        Self {
            manager,
            history_limit,
        }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ServerState {
            manager: self.manager.clone(),
            history_limit: self.history_limit,
        });

        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/ws", get(ws_handler))
            .route("/api/messages", get(history_handler))
            .route("/api/users/:id/unread", get(unread_handler))
            .route("/api/users/:id/events", get(sse_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::MessageNotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Store(e) => {
                error!("Store failure while serving request: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            ChatError::Store(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "code": self.code(), "error": message }))).into_response()
    }
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub user_id: Option<UserId>,
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let manager = state.manager.clone();
    ws.on_upgrade(move |socket| ws::handle_socket(socket, manager, params.user_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub user_id: UserId,
    pub partner_id: UserId,
    pub limit: Option<i64>,
}

async fn history_handler(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ChatError> {
    let limit = params
        .limit
        .unwrap_or(state.history_limit)
        .clamp(1, state.history_limit);

    let messages = state
        .manager
        .history(params.user_id, params.partner_id, limit)
        .await?;

    Ok(Json(messages))
}

async fn unread_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let user = UserId(id);
    let count = state.manager.peek_unread_count(user).await?;
    Ok(Json(json!({ "userId": user, "count": count })))
}

/// Read-only event feed for a single user, for clients that cannot hold a
/// WebSocket open.
async fn sse_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<i64>,
) -> Sse<impl Stream<Item = Result<Event, axum::BoxError>>> {
    let user = UserId(id);
    info!("New SSE subscriber for {}", user);

    let mut rx = state.manager.event_bus().subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if !envelope.topic.reaches(user) {
                        continue;
                    }
                    match serde_json::to_value(&envelope.event) {
                        Ok(value) => {
                            let name = value["event"].as_str().unwrap_or("message").to_string();
                            yield Ok(Event::default().event(name).data(value["data"].to_string()));
                        }
                        Err(e) => error!("Failed to serialize chat event: {}", e),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber {} lagged, {} events dropped", user, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
