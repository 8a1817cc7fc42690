//! WebSocket endpoints: inbound frame channel and outbound push topics.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::ingest::{parse_timestamp, IngestFrame, SubmitOutcome};
use crate::push_fabric::Topic;
use crate::state::AppState;

/// Inbound frame message on `/ws/frames`.
#[derive(Debug, Deserialize)]
struct FrameMessage {
    camera_id: String,
    #[serde(default)]
    frame_id: u64,
    timestamp: Option<String>,
    frame_data: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
}

/// `/ws/frames`: edge nodes push frames, the server acks each one.
pub async fn ws_frames(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_frames(socket, state))
}

async fn handle_frames(mut socket: WebSocket, state: AppState) {
    tracing::info!("Frame channel connected");

    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let _ = send_error(&mut socket, "Binary frame message is not UTF-8").await;
                    continue;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let parsed: FrameMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let _ = send_error(&mut socket, &format!("Invalid frame message: {e}")).await;
                continue;
            }
        };

        if parsed.camera_id.is_empty() || parsed.frame_data.is_empty() {
            let _ = send_error(&mut socket, "Missing camera_id or frame_data").await;
            continue;
        }

        let jpeg = match base64::engine::general_purpose::STANDARD.decode(&parsed.frame_data) {
            Ok(jpeg) => jpeg,
            Err(_) => {
                let _ = send_error(&mut socket, "frame_data is not valid base64").await;
                continue;
            }
        };

        let started = std::time::Instant::now();
        let frame_id = if parsed.frame_id > 0 {
            parsed.frame_id
        } else {
            state.coordinator.next_frame_id(&parsed.camera_id).await
        };

        let outcome = state
            .coordinator
            .submit(IngestFrame {
                camera_id: parsed.camera_id,
                frame_id,
                timestamp: parse_timestamp(parsed.timestamp.as_deref()),
                jpeg,
                width: parsed.width,
                height: parsed.height,
            })
            .await;

        let status = match outcome {
            SubmitOutcome::Queued | SubmitOutcome::ReplacedOldest => "received",
            SubmitOutcome::RejectedStale => "rejected",
        };
        let ack = json!({
            "status": status,
            "frame_id": frame_id,
            "processing_time_ms": started.elapsed().as_secs_f64() * 1000.0,
        });
        if socket.send(Message::Text(ack.to_string())).await.is_err() {
            break;
        }
    }

    tracing::info!("Frame channel disconnected");
}

async fn send_error(socket: &mut WebSocket, message: &str) -> Result<(), axum::Error> {
    socket
        .send(Message::Text(
            json!({ "status": "error", "message": message }).to_string(),
        ))
        .await
}

/// `/ws/dashboard/{camera_id}`: per-camera metrics push.
pub async fn ws_dashboard(
    ws: WebSocketUpgrade,
    Path(camera_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| forward_topic(socket, state, Topic::Metrics(camera_id)))
}

/// `/ws/alerts`: global alert push.
pub async fn ws_alerts(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| forward_topic(socket, state, Topic::Alerts))
}

/// Pump a push-fabric subscription into a socket until either side ends.
/// Subscriber cleanup is quiet; producer-side drop policy lives in the
/// fabric.
async fn forward_topic(socket: WebSocket, state: AppState, topic: Topic) {
    let (id, mut rx) = state.push.subscribe(topic).await;
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // Disconnected by the fabric's drop policy
                    None => break,
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Clients only listen on push sockets
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.push.unsubscribe(&id).await;
    tracing::debug!(subscriber_id = %id, "Push socket closed");
}
