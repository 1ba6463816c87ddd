//! `/monitor` and `/monitor-client` WebSocket endpoints
//!
//! `/monitor` serves dashboard subscribers: subscription management frames
//! in, status/stats frames out through the hub's bounded queue.
//! `/monitor-client` is ingest-only: external agents push raw samples that
//! go straight through the normalizer into the cache and fan-out.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::hub::MonitorHub;
use crate::server::connection::SocketActivity;
use crate::server::AppState;

/// Client -> server frames on `/monitor`
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SubscriberFrame {
    SubscribeServer { payload: ServerRef },
    UnsubscribeServer { payload: ServerRef },
    RequestSystemStats {
        #[serde(rename = "hostId")]
        host_id: String,
        #[serde(rename = "terminalId", default)]
        terminal_id: Option<String>,
    },
    Abort { payload: ServerRef },
    Ping,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerRef {
    server_id: String,
}

/// Inbound frames on `/monitor-client`
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentFrame {
    SystemStats { payload: serde_json::Value },
    Ping,
}

/// Subscriber socket loop.
pub async fn run_subscriber(
    socket: WebSocket,
    state: AppState,
    ws_session_id: u64,
    activity: Arc<SocketActivity>,
) {
    let (mut sender, mut receiver) = socket.split();
    let hub: Arc<MonitorHub> = state.monitor.clone();
    let queue = hub.register_subscriber(ws_session_id);

    let greeting = json!({
        "type": "session_created",
        "data": {"sessionId": ws_session_id, "connectionType": "frontend"},
    });
    if sender.send(Message::Text(greeting.to_string())).await.is_err() {
        hub.remove_subscriber(ws_session_id);
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("/monitor socket {} read error: {}", ws_session_id, e);
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

                let reply = match serde_json::from_str::<SubscriberFrame>(&text) {
                    Ok(SubscriberFrame::SubscribeServer { payload }) => {
                        hub.subscribe(ws_session_id, &payload.server_id);
                        json!({
                            "type": "subscribe_ack",
                            "data": {
                                "serverId": payload.server_id,
                                "sessionId": ws_session_id,
                                "timestamp": Utc::now().timestamp_millis(),
                            },
                        })
                    }
                    Ok(SubscriberFrame::UnsubscribeServer { payload }) => {
                        hub.unsubscribe(ws_session_id, &payload.server_id);
                        json!({
                            "type": "unsubscribe_ack",
                            "data": {
                                "serverId": payload.server_id,
                                "sessionId": ws_session_id,
                                "timestamp": Utc::now().timestamp_millis(),
                            },
                        })
                    }
                    Ok(SubscriberFrame::RequestSystemStats { host_id, terminal_id }) => {
                        debug!(
                            "Stats request for {} (terminal {:?}) from subscriber {}",
                            host_id, terminal_id, ws_session_id
                        );
                        hub.request_stats(ws_session_id, &host_id);
                        continue;
                    }
                    Ok(SubscriberFrame::Abort { payload }) => {
                        let count = hub.abort(ws_session_id, &payload.server_id);
                        json!({
                            "type": "abort_ack",
                            "data": {"serverId": payload.server_id, "count": count},
                        })
                    }
                    Ok(SubscriberFrame::Ping) => json!({"type": "pong"}),
                    Err(e) => json!({
                        "type": "error",
                        "data": {
                            "message": format!("unrecognized frame: {}", e),
                            "sessionId": ws_session_id,
                            "timestamp": Utc::now().timestamp_millis(),
                        },
                    }),
                };

                if sender.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }

            queued = queue.pop() => {
                match queued {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                        activity.touch();
                    }
                    None => break,
                }
            }

            _ = activity.closed() => {
                debug!("/monitor socket {} closed by watchdog", ws_session_id);
                break;
            }
        }
    }

    hub.remove_subscriber(ws_session_id);
    let _ = sender.close().await;
    debug!("/monitor socket {} finished", ws_session_id);
}

/// External agent ingest loop.
pub async fn run_agent(
    socket: WebSocket,
    state: AppState,
    ws_session_id: u64,
    activity: Arc<SocketActivity>,
) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.monitor.clone();

    let greeting = json!({
        "type": "session_created",
        "data": {"sessionId": ws_session_id, "connectionType": "monitor-client"},
    });
    let _ = sender.send(Message::Text(greeting.to_string())).await;

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("/monitor-client socket {} read error: {}", ws_session_id, e);
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

                match serde_json::from_str::<AgentFrame>(&text) {
                    Ok(AgentFrame::SystemStats { payload }) => {
                        let session_id = ws_session_id.to_string();
                        match hub.ingest(&payload, "monitor-client", Some(&session_id)) {
                            Some(identity) => {
                                debug!(
                                    "Sample from agent {} for {}",
                                    ws_session_id, identity
                                );
                            }
                            None => {
                                warn!(
                                    "Agent {} sent a sample without a host identifier",
                                    ws_session_id
                                );
                            }
                        }
                    }
                    Ok(AgentFrame::Ping) => {
                        if sender
                            .send(Message::Text(json!({"type": "pong"}).to_string()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let reply = json!({
                            "type": "error",
                            "data": {
                                "message": format!("unrecognized frame: {}", e),
                                "sessionId": ws_session_id,
                                "timestamp": Utc::now().timestamp_millis(),
                            },
                        });
                        if sender.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            _ = activity.closed() => {
                debug!("/monitor-client socket {} closed by watchdog", ws_session_id);
                break;
            }
        }
    }

    let _ = sender.close().await;
    debug!("/monitor-client socket {} finished", ws_session_id);
}
