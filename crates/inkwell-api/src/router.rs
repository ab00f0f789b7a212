use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use inkwell_gateway::connection::{self, decode_claims};

use crate::middleware::require_auth;
use crate::state::AppState;
use crate::{conversations, groups, messages, reactions, reads};

/// REST routes behind JWT auth, plus the WebSocket gateway.
pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations).post(conversations::open_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_conversation_messages).post(messages::send_conversation_message),
        )
        .route("/conversations/{conversation_id}/read", post(reads::advance_conversation_read))
        .route(
            "/channels/{channel_id}/messages",
            get(messages::get_channel_messages).post(messages::send_channel_message),
        )
        .route("/channels/{channel_id}/read", post(reads::advance_channel_read))
        .route("/messages/{message_id}", delete(messages::delete_message))
        .route("/reactions/{kind}/{id}", post(reactions::toggle_reaction))
        .route("/reaction-targets/{kind}/{id}", put(reactions::register_target))
        .route("/unread-summary", get(reads::unread_summary))
        .route("/groups", get(groups::list_groups).post(groups::create_group))
        .route("/groups/{group_id}", get(groups::get_group))
        .route("/groups/{group_id}/join", post(groups::join_group))
        .route("/groups/{group_id}/channels", post(groups::create_channel))
        .route(
            "/groups/{group_id}/members/{user_id}",
            put(groups::set_role).delete(groups::remove_member),
        )
        .route("/deep-links/{kind}/{id}", get(conversations::open_deep_link))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// Validates `?token=` before upgrading. Clients that cannot put the token in
/// the URL connect without it and send `Identify` instead.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let registry = state.registry.clone();
    match query.token {
        Some(token) => {
            let Some(claims) = decode_claims(&token, &state.jwt_secret) else {
                warn!("Rejected gateway upgrade with invalid token");
                return StatusCode::UNAUTHORIZED.into_response();
            };
            ws.on_upgrade(move |socket| connection::handle_connection_authenticated(socket, registry, claims.sub))
        }
        None => {
            let jwt_secret = state.jwt_secret.clone();
            ws.on_upgrade(move |socket| connection::handle_connection(socket, registry, jwt_secret))
        }
    }
}
