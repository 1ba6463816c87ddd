//! EasySSH Server - browser-accessible SSH gateway
//!
//! One long-lived process proxying interactive SSH sessions over WebSockets,
//! fanning out per-host telemetry to subscribers, and fronting an
//! OpenAI-compatible assistant endpoint with redaction and rate limiting.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (WebSocket frames, telemetry samples)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod ai;
pub mod auth;
pub mod config;
pub mod monitor;
pub mod server;
pub mod ssh;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` wins; otherwise verbosity follows
/// `NODE_ENV` via the config default.
pub fn init_logging(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
