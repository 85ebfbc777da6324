use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{delete_message, get_message, insert_message, list_messages, update_message};
use shared::{
    domain::{GroupId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ChangeEvent, MessagePatch, MessageRow, NewMessageRow},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info, warn};

use crate::AppState;

const MAX_REQUEST_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct FeedQuery {
    group_id: i64,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/groups/:group_id/messages",
            get(http_list_messages).post(http_insert_message),
        )
        .route(
            "/messages/:message_id",
            get(http_get_message)
                .patch(http_update_message)
                .delete(http_delete_message),
        )
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.api.storage.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(err) => {
            warn!(%err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
    }
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<i64>,
) -> ApiResult<Json<Vec<MessageRow>>> {
    authorize(&state, &headers)?;
    let rows = list_messages(&state.api, GroupId(group_id))
        .await
        .map_err(api_error)?;
    Ok(Json(rows))
}

async fn http_insert_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(group_id): Path<i64>,
    Json(mut message): Json<NewMessageRow>,
) -> ApiResult<Json<MessageRow>> {
    authorize(&state, &headers)?;
    message.group_id = GroupId(group_id);
    let (row, event) = insert_message(&state.api, message)
        .await
        .map_err(api_error)?;
    publish(&state, event);
    Ok(Json(row))
}

async fn http_get_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> ApiResult<Json<MessageRow>> {
    authorize(&state, &headers)?;
    let row = get_message(&state.api, MessageId(message_id))
        .await
        .map_err(api_error)?;
    Ok(Json(row))
}

async fn http_update_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
    Json(patch): Json<MessagePatch>,
) -> ApiResult<Json<MessageRow>> {
    authorize(&state, &headers)?;
    let (row, event) = update_message(&state.api, MessageId(message_id), patch)
        .await
        .map_err(api_error)?;
    publish(&state, event);
    Ok(Json(row))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> ApiResult<StatusCode> {
    authorize(&state, &headers)?;
    let event = delete_message(&state.api, MessageId(message_id))
        .await
        .map_err(api_error)?;
    publish(&state, event);
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<FeedQuery>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection.into_response();
    }
    // Subscribe before the handshake completes so no event published after
    // the client sees the upgrade is missed.
    let events_rx = state.events.subscribe();
    ws.on_upgrade(move |socket| ws_connection(events_rx, socket, GroupId(q.group_id)))
}

async fn ws_connection(
    mut events_rx: broadcast::Receiver<ChangeEvent>,
    socket: WebSocket,
    group_id: GroupId,
) {
    let (mut sender, mut receiver) = socket.split();
    info!(group_id = group_id.0, "change feed subscriber connected");

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(group_id = group_id.0, skipped, "change feed subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event.group_id() != group_id {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    info!(group_id = group_id.0, "change feed subscriber disconnected");
}

fn publish(state: &AppState, event: ChangeEvent) {
    let group_id = event.group_id();
    if state.events.send(event).is_err() {
        debug!(group_id = group_id.0, "no change feed subscribers");
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(ApiError::new(ErrorCode::Unauthorized, "missing or invalid api key")),
        ))
    }
}

fn api_error(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}
