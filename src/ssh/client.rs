//! SSH client: dial and authenticate with russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::config::{AuthMaterial, ConnectParams};
use super::error::SshError;

/// Dial the remote endpoint and authenticate.
///
/// `params.validate()` must have passed before calling. The auth material is
/// consumed here; its plaintext is scrubbed when the local binding drops at
/// the end of authentication.
pub async fn connect(
    params: &ConnectParams,
    auth: AuthMaterial,
) -> Result<client::Handle<GatewayHandler>, SshError> {
    let addr = params.addr();

    info!("Dialing SSH endpoint {}", addr);

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| SshError::ConnectionFailed(format!("failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| SshError::ConnectionFailed(format!("no address found for {}", addr)))?;

    // Protocol-level keepalive stays off: the session core runs its own
    // keepalive task with latency reporting and a 3-strike policy.
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: None,
        ..Default::default()
    };

    let handler = GatewayHandler::new(params.host.clone(), params.port);

    let mut handle = tokio::time::timeout(
        Duration::from_secs(params.timeout),
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("connection to {} timed out", addr)))?
    .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

    debug!("SSH handshake completed for {}", addr);

    let authenticated = match auth {
        AuthMaterial::Password { password } => handle
            .authenticate_password(&params.username, password.as_str())
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        AuthMaterial::Key {
            private_key,
            passphrase,
        } => {
            let key = russh::keys::decode_secret_key(
                private_key.as_str(),
                passphrase.as_deref().map(|p| p.as_str()),
            )
            .map_err(|e| SshError::KeyError(e.to_string()))?;

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(&params.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed(
            "authentication rejected by server".to_string(),
        ));
    }

    info!("SSH authentication successful for {}@{}", params.username, addr);

    Ok(handle)
}

/// Client handler for russh callbacks.
///
/// The gateway connects to whatever endpoint the authenticated user asked
/// for, so host keys are accepted and their fingerprint logged. There is no
/// known_hosts store on the server side; pinning belongs to the client's
/// server records.
pub struct GatewayHandler {
    host: String,
    port: u16,
}

impl GatewayHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// SHA256 fingerprint in the OpenSSH display form.
    pub fn fingerprint(key: &PublicKey) -> String {
        let key_bytes = key.public_key_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }
}

impl client::Handler for GatewayHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} accepted (fingerprint: {})",
            self.host,
            self.port,
            Self::fingerprint(server_public_key)
        );
        Ok(true)
    }
}
