//! SSH session core
//!
//! Per-tab SSH connection lifecycle: dial, authenticate, PTY shell, I/O
//! pumps, keepalive, registry bookkeeping.

pub mod client;
pub mod config;
pub mod error;
pub mod handle_owner;
pub mod handler;
pub mod registry;
pub mod session;

pub use config::{AuthMaterial, AuthType, ConnectParams};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
pub use registry::{SessionEntry, SessionRegistry};
pub use session::{SessionCommand, SessionState, ShellHandle};
