//! SSH session core: PTY shell channel and its I/O task
//!
//! One session per connected browser tab. The shell channel lives in its own
//! task; the `/ssh` handler drives it through [`SessionCommand`]s and drains
//! remote output from a bounded channel. Remote reads pause while the
//! outbound byte budget is exhausted, so terminal data is never dropped.

use std::sync::Arc;

use russh::ChannelMsg;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::error::SshError;
use super::handle_owner::HandleController;
use crate::server::connection::OutboundBudget;

/// Capacity of the command and stdout channels (frames, not bytes; byte
/// accounting is the budget's job)
const CHANNEL_CAPACITY: usize = 1024;

/// Upper bound for a single stdout chunk forwarded to the client
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Session lifecycle. Transitions are monotonic; retryable failures before
/// `Open` jump straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Dialing,
    Authenticating,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Dialing => 0,
            SessionState::Authenticating => 1,
            SessionState::Open => 2,
            SessionState::Closing => 3,
            SessionState::Closed => 4,
        }
    }

    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        next.rank() > self.rank()
    }

    /// States in which the session appears in the registry.
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            SessionState::Authenticating | SessionState::Open | SessionState::Closing
        )
    }
}

/// Commands accepted by the shell channel task
#[derive(Debug)]
pub enum SessionCommand {
    /// Client bytes for the PTY
    Data(Vec<u8>),
    /// Window change (cols, rows)
    Resize(u16, u16),
    /// Close the channel
    Close,
}

/// Handle to an open shell channel.
pub struct ShellHandle {
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    pub stdout_rx: mpsc::Receiver<Vec<u8>>,
}

/// Open a PTY shell on the connection and spawn its channel task.
///
/// The task ends when the client sends `Close`, the remote closes the
/// channel, or the controller's owner task goes away.
pub async fn open_shell(
    controller: &HandleController,
    connection_id: &str,
    cols: u16,
    rows: u16,
    budget: Arc<OutboundBudget>,
) -> Result<ShellHandle, SshError> {
    let mut channel = controller.open_session_channel().await?;

    debug!("Channel opened for {}, requesting PTY", connection_id);

    channel
        .request_pty(false, "xterm-256color", cols as u32, rows as u32, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    channel
        .request_shell(false)
        .await
        .map_err(|e| SshError::ChannelError(format!("shell request failed: {}", e)))?;

    info!("Interactive shell started for connection {}", connection_id);

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(CHANNEL_CAPACITY);
    let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    let conn_id = connection_id.to_string();
    tokio::spawn(async move {
        debug!("Shell channel task started for connection {}", conn_id);

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        SessionCommand::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to write to SSH channel: {}", e);
                                break;
                            }
                        }
                        SessionCommand::Resize(cols, rows) => {
                            if let Err(e) = channel
                                .window_change(cols as u32, rows as u32, 0, 0)
                                .await
                            {
                                // Resize failures are not fatal to the stream
                                error!("Failed to resize PTY: {}", e);
                            } else {
                                debug!("PTY resized to {}x{} for connection {}", cols, rows, conn_id);
                            }
                        }
                        SessionCommand::Close => {
                            debug!("Close command received for connection {}", conn_id);
                            let _ = channel.eof().await;
                            break;
                        }
                    }
                }

                Some(msg) = channel.wait() => {
                    match msg {
                        ChannelMsg::Data { data } => {
                            if forward_chunk(&stdout_tx, &budget, data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        ChannelMsg::ExtendedData { data, ext } => {
                            // ext == 1 is stderr; merge into the terminal stream
                            if ext == 1
                                && forward_chunk(&stdout_tx, &budget, data.to_vec()).await.is_err()
                            {
                                break;
                            }
                        }
                        ChannelMsg::Eof => {
                            info!("SSH channel EOF for connection {}", conn_id);
                            break;
                        }
                        ChannelMsg::Close => {
                            info!("SSH channel closed for connection {}", conn_id);
                            break;
                        }
                        ChannelMsg::ExitStatus { exit_status } => {
                            debug!("SSH channel exit status {} for connection {}", exit_status, conn_id);
                        }
                        ChannelMsg::ExitSignal { signal_name, .. } => {
                            debug!("SSH channel exit signal {:?} for connection {}", signal_name, conn_id);
                        }
                        ChannelMsg::WindowAdjusted { .. } => {}
                        _ => {
                            debug!("Unhandled channel message for connection {}", conn_id);
                        }
                    }
                }

                else => break,
            }
        }

        debug!("Shell channel task terminated for connection {}", conn_id);
    });

    Ok(ShellHandle { cmd_tx, stdout_rx })
}

/// Forward one chunk to the WebSocket writer, waiting on the byte budget
/// first. Waiting here is the backpressure: while we are parked, the channel
/// is not polled and the SSH flow-control window fills up.
async fn forward_chunk(
    stdout_tx: &mpsc::Sender<Vec<u8>>,
    budget: &OutboundBudget,
    data: Vec<u8>,
) -> Result<(), ()> {
    for chunk in data.chunks(MAX_CHUNK_BYTES) {
        budget.acquire(chunk.len()).await;
        if stdout_tx.send(chunk.to_vec()).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_monotonic() {
        use SessionState::*;
        assert!(Dialing.can_advance_to(Authenticating));
        assert!(Authenticating.can_advance_to(Open));
        assert!(Open.can_advance_to(Closing));
        assert!(Closing.can_advance_to(Closed));
        // Failures may skip ahead but never backwards
        assert!(Dialing.can_advance_to(Closed));
        assert!(!Open.can_advance_to(Dialing));
        assert!(!Closed.can_advance_to(Open));
        assert!(!Closed.can_advance_to(Closed));
    }

    #[test]
    fn registry_visibility_follows_state() {
        use SessionState::*;
        assert!(!Dialing.is_registered());
        assert!(Authenticating.is_registered());
        assert!(Open.is_registered());
        assert!(Closing.is_registered());
        assert!(!Closed.is_registered());
    }
}
