//! Single-owner task for the SSH `Handle`
//!
//! Only one task owns the `Handle<GatewayHandler>`. Everything else (the
//! session core, the telemetry collector) talks to it through a cloneable
//! [`HandleController`] over an mpsc channel. This avoids `Arc<Mutex<Handle>>`
//! contention and protocol violations from concurrent Handle access.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::GatewayHandler;
use super::error::SshError;

/// Keepalive probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Reply received
    Ok,
    /// No reply in time (soft failure, counted toward the strike limit)
    Timeout,
    /// Transport gone (hard failure)
    IoError,
}

pub enum HandleCommand {
    /// Open a session channel (PTY shell or collector exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    /// keepalive@openssh.com with want_reply
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },
    /// Tear down the SSH connection
    Disconnect,
}

/// Cloneable command endpoint for the handle owner task.
///
/// Holding a controller grants full control of the SSH connection; it never
/// leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Build a controller around a bare command channel.
    ///
    /// Primarily for tests; production controllers come from
    /// [`spawn_handle_owner_task`].
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Subscribe to the connection-closed notification.
    ///
    /// Collector tasks select on this receiver so teardown always proceeds
    /// session-out.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a session channel.
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Send a keepalive probe and wait for the reply.
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandleCommand::Ping { reply_tx })
            .await
            .is_err()
        {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Tear down the SSH connection.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still alive.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the owner task, consuming the Handle.
pub fn spawn_handle_owner_task(
    handle: Handle<GatewayHandler>,
    connection_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_task = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;

        debug!("Handle owner task started for connection {}", connection_id);

        loop {
            match cmd_rx.recv().await {
                Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                        // Dropped channel is closed by the server side
                    }
                }
                Some(HandleCommand::Ping { reply_tx }) => {
                    let result = match tokio::time::timeout(
                        std::time::Duration::from_secs(5),
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            let error_str = format!("{:?}", e);
                            if error_str.to_ascii_lowercase().contains("disconnect") {
                                warn!(
                                    "Keepalive disconnect for connection {}: {:?}",
                                    connection_id, e
                                );
                                PingResult::IoError
                            } else {
                                warn!(
                                    "Keepalive error for connection {} (soft failure): {:?}",
                                    connection_id, e
                                );
                                PingResult::Timeout
                            }
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for connection {} (5s)", connection_id);
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }
                Some(HandleCommand::Disconnect) => {
                    info!("Disconnect requested for connection {}", connection_id);
                    break;
                }
                None => {
                    debug!("All controllers dropped for connection {}", connection_id);
                    break;
                }
            }
        }

        // Notify subscribers (collector tasks) before the transport goes away,
        // then drain queued commands so no caller hangs on a reply.
        let _ = disconnect_tx_task.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        debug!("Handle owner task terminated for connection {}", connection_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
