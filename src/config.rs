//! Server configuration from environment variables

use std::net::{IpAddr, Ipv4Addr};

use rand::RngCore;
use tracing::warn;

/// Default HTTP/WebSocket listen port
const DEFAULT_PORT: u16 = 8000;

/// Runtime configuration for the gateway process.
///
/// Everything here comes from the environment at startup; per-module tunables
/// (rate limits, probe intervals, backpressure budgets) live as constants in
/// their own modules and are overridable through constructors in tests.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the single HTTP/WebSocket listener on
    pub host: IpAddr,
    /// TCP port shared by HTTP and all WebSocket paths
    pub port: u16,
    /// HMAC secret for Bearer JWT validation
    pub jwt_secret: String,
    /// Symmetric key for SSH credential blobs delivered by the external CRUD
    pub encryption_key: Option<String>,
    /// Key material for the AI credential vault (scrypt input)
    pub ai_encryption_key: Option<String>,
    /// Production mode lowers default log verbosity
    pub production: bool,
}

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        let port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let host = std::env::var("SERVER_HOST")
            .ok()
            .and_then(|v| v.parse::<IpAddr>().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                warn!(
                    "JWT_SECRET is not set; generating an ephemeral secret. \
                     Tokens will only validate within this process lifetime."
                );
                let mut raw = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut raw);
                hex::encode(raw)
            }
        };

        let production = std::env::var("NODE_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        Self {
            host,
            port,
            jwt_secret,
            encryption_key: non_empty_env("ENCRYPTION_KEY"),
            ai_encryption_key: non_empty_env("AI_ENCRYPTION_KEY"),
            production,
        }
    }

    /// Default log filter directive for this environment.
    pub fn default_log_filter(&self) -> &'static str {
        if self.production {
            "info"
        } else {
            "easyssh_server=debug,info"
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_by_env() {
        let mut config = ServerConfig {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            jwt_secret: "s".into(),
            encryption_key: None,
            ai_encryption_key: None,
            production: true,
        };
        assert_eq!(config.default_log_filter(), "info");
        config.production = false;
        assert!(config.default_log_filter().contains("debug"));
    }
}
