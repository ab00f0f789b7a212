use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use inkwell_types::api::{AdvanceReadRequest, Claims};
use inkwell_types::models::ContainerId;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn advance_conversation_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AdvanceReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let container = ContainerId::Conversation(conversation_id);
    Ok(Json(state.service.advance_read(claims.sub, container, req.position).await?))
}

pub async fn advance_channel_read(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AdvanceReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let container = ContainerId::Channel(channel_id);
    Ok(Json(state.service.advance_read(claims.sub, container, req.position).await?))
}

pub async fn unread_summary(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.unread_summary(claims.sub).await?))
}
