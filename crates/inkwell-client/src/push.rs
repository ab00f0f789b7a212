use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use inkwell_types::events::{PushEvent, Ready};

use crate::state::ClientState;
use crate::transport::TransportError;

/// Gateway URL for an HTTP API base, carrying the token on the upgrade.
pub fn gateway_url(api_url: &str, token: &str) -> String {
    let base = api_url.trim_end_matches('/').replacen("http://", "ws://", 1).replacen("https://", "wss://", 1);
    format!("{base}/gateway?token={token}")
}

/// Reads pushed events into `state` until the server closes the connection.
///
/// Returns the connection id from the `ready` frame. Reconnecting is the
/// caller's job, followed by a `catch_up` for every open container.
pub async fn listen(url: &str, state: Arc<Mutex<ClientState>>) -> Result<Option<uuid::Uuid>, TransportError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (_ws_tx, mut ws_rx) = ws_stream.split();
    let mut connection_id = None;

    while let Some(frame) = ws_rx.next().await {
        match frame? {
            Message::Text(text) => {
                if connection_id.is_none() {
                    if let Ok(ready) = serde_json::from_str::<Ready>(text.as_str()) {
                        info!("Gateway ready, connection {}", ready.connection_id);
                        connection_id = Some(ready.connection_id);
                        continue;
                    }
                }
                match serde_json::from_str::<PushEvent>(text.as_str()) {
                    Ok(event) => {
                        debug!("push {:?}", event.kind());
                        state.lock().unwrap_or_else(PoisonError::into_inner).apply_push(event);
                    }
                    Err(e) => warn!("Undecodable push: {}", e),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Ok(connection_id)
}
