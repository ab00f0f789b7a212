use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use inkwell_types::api::{Claims, MessagesQuery, SendMessageRequest};
use inkwell_types::models::ContainerId;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn send_conversation_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    send(state, ContainerId::Conversation(conversation_id), claims, req).await
}

pub async fn send_channel_message(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    send(state, ContainerId::Channel(channel_id), claims, req).await
}

async fn send(
    state: AppState,
    container: ContainerId,
    claims: Claims,
    req: SendMessageRequest,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .service
        .send_message(claims.sub, container, req.body, req.correlation_id)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn get_conversation_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let page = state
        .service
        .messages_after(claims.sub, ContainerId::Conversation(conversation_id), query.after, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn get_channel_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let page = state
        .service
        .messages_after(claims.sub, ContainerId::Channel(channel_id), query.after, query.limit)
        .await?;
    Ok(Json(page))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let message = state.service.delete_message(claims.sub, message_id).await?;
    Ok(Json(message))
}
