use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use inkwell_types::api::{Claims, ToggleReactionRequest};
use inkwell_types::models::{ReactionTarget, ReactionTargetKind};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn target(kind: &str, id: Uuid) -> ApiResult<ReactionTarget> {
    let kind: ReactionTargetKind = kind
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("unknown reaction target kind '{kind}'")))?;
    Ok(ReactionTarget { kind, id })
}

pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> ApiResult<impl IntoResponse> {
    let target = target(&kind, id)?;
    let toggled = state
        .service
        .toggle_reaction(claims.sub, target, req.emoji, req.correlation_id)
        .await?;
    Ok(Json(toggled))
}

/// Called by the services that own comments and reviews.
pub async fn register_target(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, Uuid)>,
    Extension(_claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let target = target(&kind, id)?;
    let created = state.service.register_reaction_target(target).await?;
    Ok(if created { StatusCode::CREATED } else { StatusCode::NO_CONTENT })
}
