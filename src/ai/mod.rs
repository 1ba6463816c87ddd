//! AI request pipeline
//!
//! Rate-limited, redaction-guarded proxy to an OpenAI-compatible chat
//! completion endpoint, with encrypted credential storage and per-user
//! usage accounting.

pub mod context;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod rate_limit;
pub mod redactor;
pub mod usage;
pub mod vault;

pub use error::AiError;
pub use pipeline::{AiService, ChatMessage, ChatRequest, TestConnectionParams};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use vault::{ApiConfig, CredentialVault, MemorySettingsStore, SecretCipher, SettingsStore};
