//! `/ssh` WebSocket endpoint
//!
//! Drives one SSH session per socket: decodes client frames, owns the
//! connect/disconnect lifecycle, pumps terminal output, and relays the
//! keepalive task's verdicts. All tasks belonging to the session are
//! cancelled session-out: SSH channel first, WebSocket second.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{AuthMaterial, ConnectParams};
use super::error::SshError;
use crate::ai::vault::{CredentialVault, SecretCipher};
use super::registry::SessionEntry;
use super::session::{self, SessionCommand, SessionState};
use super::{client, spawn_handle_owner_task, PingResult};
use crate::server::connection::{OutboundBudget, SocketActivity};
use crate::server::AppState;

/// Consecutive keepalive misses before the session is declared lost
const KEEPALIVE_MAX_MISSES: u32 = 3;

/// Client -> server frames on `/ssh`
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Connect { payload: ConnectParams },
    Data { payload: String },
    Resize { payload: ResizePayload },
    Disconnect,
    Ping,
}

#[derive(Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

/// Verdicts from the per-session keepalive task
#[derive(Debug)]
enum KeepaliveEvent {
    /// Round-trip measured
    Latency(u64),
    /// Three consecutive misses, or the transport died
    Lost,
}

/// Live session state held by the handler between frames.
struct ActiveSession {
    entry: Arc<SessionEntry>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    keepalive_rx: mpsc::Receiver<KeepaliveEvent>,
}

pub async fn run(
    socket: WebSocket,
    state: AppState,
    user_id: String,
    ws_session_id: u64,
    activity: Arc<SocketActivity>,
) {
    let (mut sender, mut receiver) = socket.split();
    let budget = OutboundBudget::with_default_limit();

    let mut active: Option<ActiveSession> = None;
    let mut stdout_rx: Option<mpsc::Receiver<Vec<u8>>> = None;

    debug!("/ssh socket {} open for user {}", ws_session_id, user_id);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("/ssh socket {} read error: {}", ws_session_id, e);
                        break;
                    }
                    None => break,
                };
                activity.touch();

                match message {
                    Message::Text(text) => {
                        let outcome = handle_frame(
                            &text,
                            &state,
                            &user_id,
                            &mut active,
                            &mut stdout_rx,
                            &budget,
                            &mut sender,
                        )
                        .await;
                        if outcome.is_err() {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        // Raw terminal bytes, bypassing the JSON envelope
                        if let Some(session) = active.as_ref() {
                            let _ = session.cmd_tx.send(SessionCommand::Data(data)).await;
                        }
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            }

            chunk = recv_opt(&mut stdout_rx) => {
                match chunk {
                    Some(data) => {
                        let len = data.len();
                        let frame = json!({
                            "type": "data",
                            "payload": String::from_utf8_lossy(&data),
                        });
                        let result = sender.send(Message::Text(frame.to_string())).await;
                        budget.release(len);
                        if result.is_err() {
                            break;
                        }
                        activity.touch();
                    }
                    None => {
                        // Remote EOF while the session is up
                        if let Some(session) = active.take() {
                            stdout_rx = None;
                            teardown(&state, &session.entry).await;
                            let _ = send_json(
                                &mut sender,
                                json!({"type": "disconnected"}),
                            )
                            .await;
                        }
                    }
                }
            }

            event = keepalive_opt(&mut active) => {
                match event {
                    Some(KeepaliveEvent::Latency(ms)) => {
                        if send_json(&mut sender, json!({"type": "latency", "data": {"ms": ms}}))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(KeepaliveEvent::Lost) | None => {
                        if let Some(session) = active.take() {
                            stdout_rx = None;
                            teardown(&state, &session.entry).await;
                            let _ = send_json(
                                &mut sender,
                                json!({
                                    "type": "connectError",
                                    "data": {"code": "keepaliveLost", "message": "keepalive lost"},
                                }),
                            )
                            .await;
                            let _ = send_json(&mut sender, json!({"type": "disconnected"})).await;
                        }
                    }
                }
            }

            _ = activity.closed() => {
                debug!("/ssh socket {} closed by watchdog", ws_session_id);
                break;
            }
        }
    }

    // Session-out teardown: SSH channel before the WebSocket
    if let Some(session) = active.take() {
        teardown(&state, &session.entry).await;
    }
    let _ = sender.close().await;
    debug!("/ssh socket {} finished", ws_session_id);
}

/// Decode and dispatch one JSON frame. `Err` means the socket is gone.
async fn handle_frame(
    text: &str,
    state: &AppState,
    user_id: &str,
    active: &mut Option<ActiveSession>,
    stdout_rx: &mut Option<mpsc::Receiver<Vec<u8>>>,
    budget: &Arc<OutboundBudget>,
    sender: &mut (impl SinkExt<Message> + Unpin),
) -> Result<(), ()> {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Unknown or malformed frames answer an error and keep the socket
            return send_json(
                sender,
                json!({
                    "type": "error",
                    "data": {"code": "invalidRequest", "message": format!("unrecognized frame: {}", e)},
                }),
            )
            .await;
        }
    };

    match frame {
        ClientFrame::Connect { payload } => {
            if active.is_some() {
                return send_json(
                    sender,
                    json!({
                        "type": "error",
                        "data": {"code": "invalidRequest", "message": "session already connected"},
                    }),
                )
                .await;
            }
            match establish(state, user_id, payload, budget.clone()).await {
                Ok((session, rx)) => {
                    let connection_id = session.entry.connection_id.clone();
                    *stdout_rx = Some(rx);
                    *active = Some(session);
                    send_json(
                        sender,
                        json!({"type": "connected", "data": {"sessionId": connection_id}}),
                    )
                    .await
                }
                Err(e) => {
                    // Dial and auth failures are terminal for the attempt,
                    // not for the socket; the client may retry with a fresh
                    // connect frame.
                    send_json(
                        sender,
                        json!({
                            "type": "connectError",
                            "data": {"code": e.code(), "message": e.to_string()},
                        }),
                    )
                    .await
                }
            }
        }
        ClientFrame::Data { payload } => {
            if let Some(session) = active.as_ref() {
                let _ = session
                    .cmd_tx
                    .send(SessionCommand::Data(payload.into_bytes()))
                    .await;
            }
            Ok(())
        }
        ClientFrame::Resize { payload } => {
            // Silently ignored when no session is open
            if let Some(session) = active.as_ref() {
                let _ = session
                    .cmd_tx
                    .send(SessionCommand::Resize(payload.cols, payload.rows))
                    .await;
            }
            Ok(())
        }
        ClientFrame::Disconnect => {
            if let Some(session) = active.take() {
                *stdout_rx = None;
                teardown(state, &session.entry).await;
            }
            send_json(sender, json!({"type": "disconnected"})).await
        }
        ClientFrame::Ping => send_json(sender, json!({"type": "pong"})).await,
    }
}

/// Dial, authenticate, open the shell, register, and spawn the collector
/// and keepalive tasks.
async fn establish(
    state: &AppState,
    user_id: &str,
    mut params: ConnectParams,
    budget: Arc<OutboundBudget>,
) -> Result<(ActiveSession, mpsc::Receiver<Vec<u8>>), SshError> {
    params.validate()?;

    let auth = resolve_auth(params.take_auth(), state.ssh_cipher.as_deref())?;
    let connection_id = uuid::Uuid::new_v4().to_string();

    // dialing -> authenticating happen inside connect(); the auth material
    // is consumed there and scrubbed before the function returns.
    let handle = client::connect(&params, auth).await?;

    let resolved_ip = resolve_ip(&params.host, params.port).await;
    let controller = spawn_handle_owner_task(handle, connection_id.clone());

    let entry = Arc::new(SessionEntry::new(
        connection_id.clone(),
        user_id.to_string(),
        params.host.clone(),
        resolved_ip,
        params.port,
        params.username.clone(),
        controller.clone(),
    ));

    if let Err(e) = state.registry.register(entry.clone()) {
        controller.disconnect().await;
        return Err(e);
    }

    let shell = match session::open_shell(
        &controller,
        &connection_id,
        params.cols,
        params.rows,
        budget,
    )
    .await
    {
        Ok(shell) => shell,
        Err(e) => {
            state.registry.remove(&connection_id);
            let _ = entry.advance(SessionState::Closed);
            controller.disconnect().await;
            return Err(e);
        }
    };

    entry.advance(SessionState::Open)?;
    info!(
        "Session {} open: {}@{}:{} (user {})",
        connection_id, params.username, params.host, params.port, user_id
    );

    // Telemetry collector shares the SSH connection and stops with it
    crate::monitor::collector::spawn(entry.clone(), state.monitor.clone());

    let keepalive_rx = spawn_keepalive_task(entry.clone(), params.keep_alive.clamp(5, 600));

    Ok((
        ActiveSession {
            entry,
            cmd_tx: shell.cmd_tx,
            keepalive_rx,
        },
        shell.stdout_rx,
    ))
}

/// Per-session keepalive task: probe on the configured interval, report
/// round-trip latency, and declare the session lost after three consecutive
/// misses. Exits with the SSH connection.
fn spawn_keepalive_task(
    entry: Arc<SessionEntry>,
    interval_secs: u64,
) -> mpsc::Receiver<KeepaliveEvent> {
    let (event_tx, event_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        let mut disconnect_rx = entry.controller.subscribe_disconnect();
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();

        let mut seq: u64 = 0;
        let mut misses: u32 = 0;

        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => break,
                _ = interval.tick() => {}
            }

            seq += 1;
            let started = Instant::now();
            match entry.controller.ping().await {
                PingResult::Ok => {
                    misses = 0;
                    let ms = started.elapsed().as_millis() as u64;
                    debug!(
                        "Keepalive #{} for session {}: {}ms",
                        seq, entry.connection_id, ms
                    );
                    if event_tx.send(KeepaliveEvent::Latency(ms)).await.is_err() {
                        break;
                    }
                }
                PingResult::Timeout => {
                    misses += 1;
                    warn!(
                        "Keepalive #{} missed ({}/{}) for session {}",
                        seq, misses, KEEPALIVE_MAX_MISSES, entry.connection_id
                    );
                }
                PingResult::IoError => {
                    misses = KEEPALIVE_MAX_MISSES;
                }
            }

            if misses >= KEEPALIVE_MAX_MISSES {
                let _ = event_tx.send(KeepaliveEvent::Lost).await;
                break;
            }
        }

        debug!("Keepalive task ended for session {}", entry.connection_id);
    });

    event_rx
}

/// Credential pass-through: secrets the external CRUD stored encrypted
/// arrive in the `encrypted:` wire form and are decrypted just-in-time.
/// Plaintext secrets pass unchanged.
fn resolve_auth(
    auth: AuthMaterial,
    cipher: Option<&SecretCipher>,
) -> Result<AuthMaterial, SshError> {
    let decrypt = |secret: zeroize::Zeroizing<String>| -> Result<zeroize::Zeroizing<String>, SshError> {
        if !CredentialVault::is_encrypted_data(&secret) {
            return Ok(secret);
        }
        let cipher = cipher.ok_or_else(|| {
            SshError::AuthenticationFailed(
                "stored credential is encrypted but ENCRYPTION_KEY is not set".into(),
            )
        })?;
        let plaintext = cipher
            .decrypt(&secret)
            .map_err(|_| SshError::AuthenticationFailed("stored credential is unreadable".into()))?;
        String::from_utf8(plaintext.to_vec())
            .map(zeroize::Zeroizing::new)
            .map_err(|_| SshError::AuthenticationFailed("stored credential is unreadable".into()))
    };

    Ok(match auth {
        AuthMaterial::Password { password } => AuthMaterial::Password {
            password: decrypt(password)?,
        },
        AuthMaterial::Key {
            private_key,
            passphrase,
        } => AuthMaterial::Key {
            private_key: decrypt(private_key)?,
            passphrase: passphrase.map(decrypt).transpose()?,
        },
    })
}

/// Close the SSH side of a session and drop it from the registry.
async fn teardown(state: &AppState, entry: &Arc<SessionEntry>) {
    if entry.state() == SessionState::Closed {
        return;
    }
    let _ = entry.advance(SessionState::Closing);
    entry.controller.disconnect().await;
    let _ = entry.advance(SessionState::Closed);
    state.registry.remove(&entry.connection_id);
    info!("Session {} closed", entry.connection_id);
}

async fn resolve_ip(host: &str, port: u16) -> Option<String> {
    let addr = format!("{}:{}", host, port);
    tokio::task::spawn_blocking(move || {
        use std::net::ToSocketAddrs;
        addr.to_socket_addrs()
            .ok()?
            .next()
            .map(|sa| sa.ip().to_string())
    })
    .await
    .ok()
    .flatten()
}

async fn send_json(
    sender: &mut (impl SinkExt<Message> + Unpin),
    value: serde_json::Value,
) -> Result<(), ()> {
    sender
        .send(Message::Text(value.to_string()))
        .await
        .map_err(|_| ())
}

/// Await the next stdout chunk, or park forever when no session is open.
async fn recv_opt(rx: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Await the next keepalive verdict, or park forever when no session is
/// open.
async fn keepalive_opt(active: &mut Option<ActiveSession>) -> Option<KeepaliveEvent> {
    match active {
        Some(session) => session.keepalive_rx.recv().await,
        None => std::future::pending().await,
    }
}
