use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use inkwell_types::api::{Claims, OpenConversationRequest};

use crate::deep_link::DeepLink;
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn open_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<OpenConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let view = state.service.open_conversation(claims.sub, req.peer_id).await?;
    let status = if view.created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(view)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.list_conversations(claims.sub).await?))
}

pub async fn open_deep_link(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let link = DeepLink::parse(&kind, id)?;
    Ok(Json(state.service.open_deep_link(claims.sub, link).await?))
}
