use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use application::{ApplicationError, Direction, MessagePage, MessagePageRequest};
use domain::{OnlineUser, RoomId, SequenceNumber, UserId};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct ChatQuery {
    user_id: Uuid,
    nickname: String,
    profile_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatcherQuery {
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    user_id: Uuid,
    cursor: Option<SequenceNumber>,
    limit: Option<u32>,
    #[serde(default)]
    direction: Direction,
}

#[derive(Debug, Deserialize)]
struct MembershipPayload {
    user_id: Uuid,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/chat", get(chat_upgrade))
        .route("/ws/online-users", get(online_users_upgrade))
        .nest("/api/v1", api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/rooms/{room_id}/messages", get(get_history))
        .route("/rooms/{room_id}/join", post(join_room))
        .route("/rooms/{room_id}/leave", post(leave_room))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn chat_upgrade(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = UserId::from(query.user_id);
    let rooms = state.rooms.rooms_for_user(user_id).await?;
    let profile = OnlineUser::new(user_id, query.nickname, query.profile_image);
    let connection = WebSocketConnection::chat(
        state.gateway.clone(),
        profile,
        rooms,
        state.outbound_buffer,
    );
    Ok(ws.on_upgrade(move |socket| connection.run(socket)))
}

async fn online_users_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WatcherQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let connection = WebSocketConnection::presence_watcher(
        state.gateway.clone(),
        UserId::from(query.user_id),
        state.outbound_buffer,
    );
    ws.on_upgrade(move |socket| connection.run(socket))
}

async fn get_history(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    let request = MessagePageRequest {
        room_id: RoomId::from(room_id),
        cursor: query.cursor,
        limit: query.limit,
        direction: query.direction,
    };
    let page = state
        .gateway
        .history(UserId::from(query.user_id), &request)
        .await?;

    Ok(Json(page))
}

/// 加入房间，用户在本进程已打开的连接立即开始接收该房间消息
async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<MembershipPayload>,
) -> Result<StatusCode, ApiError> {
    let (room_id, user_id) = (RoomId::from(room_id), UserId::from(payload.user_id));
    state.members.insert_member(room_id, user_id).await?;
    state.gateway.join_room(user_id, room_id).await;

    Ok(StatusCode::NO_CONTENT)
}

async fn leave_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Json(payload): Json<MembershipPayload>,
) -> Result<StatusCode, ApiError> {
    let (room_id, user_id) = (RoomId::from(room_id), UserId::from(payload.user_id));
    if !state.members.delete_member(room_id, user_id).await? {
        return Err(ApplicationError::not_room_member(room_id, user_id).into());
    }
    state.gateway.leave_room(user_id, room_id).await;

    Ok(StatusCode::NO_CONTENT)
}
