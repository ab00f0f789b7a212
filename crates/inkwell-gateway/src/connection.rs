use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use inkwell_types::api::Claims;
use inkwell_types::events::{GatewayCommand, Ready};

use crate::registry::{ConnectionHandle, ConnectionRegistry, Frame};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Legacy clients must identify within this window.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Validates a JWT issued by the external auth service.
pub fn decode_claims(token: &str, jwt_secret: &str) -> Option<Claims> {
    decode::<Claims>(token, &DecodingKey::from_secret(jwt_secret.as_bytes()), &Validation::default())
        .map(|data| data.claims)
        .ok()
}

/// Handle a connection whose token was validated on the upgrade request.
pub async fn handle_connection_authenticated(socket: WebSocket, registry: ConnectionRegistry, user_id: Uuid) {
    let (sender, receiver) = socket.split();
    info!("{} connected to gateway (pre-authenticated)", user_id);
    run_connection_loop(sender, receiver, registry, user_id).await;
}

/// Handle a connection from a client that sends `Identify` after the upgrade.
pub async fn handle_connection(socket: WebSocket, registry: ConnectionRegistry, jwt_secret: String) {
    let (sender, mut receiver) = socket.split();

    let Some(user_id) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    info!("{} connected to gateway", user_id);
    run_connection_loop(sender, receiver, registry, user_id).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    registry: ConnectionRegistry,
    user_id: Uuid,
) {
    let (handle, frames) = ConnectionHandle::new(user_id);
    let conn_id = handle.conn_id;

    let ready = Ready { user_id, connection_id: conn_id };
    let ready = match serde_json::to_string(&ready) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode ready frame: {}", e);
            return;
        }
    };
    // Registered before `ready` goes out: anything committed after the
    // client sees `ready` is pushed on this connection.
    registry.register(handle).await;
    if sender.send(Message::Text(ready.into())).await.is_err() {
        registry.unregister(conn_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let mut send_task = tokio::spawn(forward_frames(sender, frames, pong_flag_send));

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(GatewayCommand::Heartbeat) => {
                        pong_flag_recv.store(true, Ordering::Release);
                    }
                    Ok(GatewayCommand::Identify { .. }) => {
                        debug!("{} sent Identify on an identified connection", user_id);
                    }
                    Err(e) => {
                        let raw: String = text.chars().take(200).collect();
                        warn!("{} bad command: {} -- raw: {}", user_id, e, raw);
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    registry.unregister(conn_id).await;
    info!("{} ({}) disconnected from gateway", user_id, conn_id);
}

/// Relays pushed frames to the socket and keeps the heartbeat.
async fn forward_frames(
    mut sender: SplitSink<WebSocket, Message>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    pong_flag: Arc<AtomicBool>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_flag.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, jwt_secret: &str) -> Option<Uuid> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) {
                    return decode_claims(&token, jwt_secret).map(|claims| claims.sub);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}
