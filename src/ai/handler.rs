//! `/ai` WebSocket endpoint

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::pipeline::{ChatOutcome, ChatRequest, StreamEvent};
use crate::server::connection::SocketActivity;
use crate::server::AppState;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AiFrame {
    Chat { payload: ChatRequest },
    Ping,
}

pub async fn run(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    ws_session_id: u64,
    activity: Arc<SocketActivity>,
) {
    let (mut sender, mut receiver) = socket.split();

    debug!("/ai socket {} open for user {}", ws_session_id, user_id);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("/ai socket {} read error: {}", ws_session_id, e);
                        break;
                    }
                    None => break,
                };
                activity.touch();

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };

                match serde_json::from_str::<AiFrame>(&text) {
                    Ok(AiFrame::Chat { payload }) => {
                        if handle_chat(&state, &user_id, payload, &mut sender, &activity)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(AiFrame::Ping) => {
                        if send(&mut sender, json!({"type": "pong"})).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let frame = json!({
                            "type": "error",
                            "data": {"code": "invalidRequest", "message": format!("unrecognized frame: {}", e)},
                        });
                        if send(&mut sender, frame).await.is_err() {
                            break;
                        }
                    }
                }
            }

            _ = activity.closed() => {
                debug!("/ai socket {} closed by watchdog", ws_session_id);
                break;
            }
        }
    }

    let _ = sender.close().await;
    debug!("/ai socket {} finished", ws_session_id);
}

async fn handle_chat(
    state: &AppState,
    user_id: &str,
    request: ChatRequest,
    sender: &mut (impl SinkExt<Message> + Unpin),
    activity: &SocketActivity,
) -> Result<(), ()> {
    match state.ai.chat(user_id, request).await {
        Ok(ChatOutcome::Complete {
            content,
            usage,
            security_warning,
        }) => {
            send(sender, json!({"type": "delta", "data": {"content": content}})).await?;
            let mut data = json!({"usage": usage});
            if let Some(warning) = security_warning {
                data["securityWarning"] = json!(warning);
            }
            send(sender, json!({"type": "done", "data": data})).await
        }
        Ok(ChatOutcome::Stream {
            mut events,
            security_warning,
        }) => {
            while let Some(event) = events.recv().await {
                activity.touch();
                match event {
                    StreamEvent::Delta(content) => {
                        send(sender, json!({"type": "delta", "data": {"content": content}}))
                            .await?;
                    }
                    StreamEvent::Done(usage) => {
                        let mut data = json!({"usage": usage});
                        if let Some(warning) = &security_warning {
                            data["securityWarning"] = json!(warning);
                        }
                        send(sender, json!({"type": "done", "data": data})).await?;
                    }
                    StreamEvent::Error(e) => {
                        let frame = json!({
                            "type": "error",
                            "data": {"code": e.code(), "message": e.client_message()},
                        });
                        send(sender, frame).await?;
                    }
                }
            }
            Ok(())
        }
        Err(e) => {
            let mut data = json!({"code": e.code(), "message": e.client_message()});
            if let crate::ai::error::AiError::RateLimited(decision) = &e {
                data["resetTime"] = json!(decision.reset_time);
            }
            send(sender, json!({"type": "error", "data": data})).await
        }
    }
}

async fn send(
    sender: &mut (impl SinkExt<Message> + Unpin),
    value: serde_json::Value,
) -> Result<(), ()> {
    sender
        .send(Message::Text(value.to_string()))
        .await
        .map_err(|_| ())
}
