//! Live session registry
//!
//! Indexes every live SSH session by connection id and by each of its
//! descriptor strings so the monitoring plane can resolve fuzzy host
//! identifiers (bare IP, `user@host`, `host:port`, `hostname@ip`) to
//! sessions. Thread-safe via DashMap; registration is guarded by a create
//! lock so the connection limit check and the insert are atomic.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::HandleController;
use super::session::SessionState;

/// Default maximum concurrent SSH sessions
const DEFAULT_MAX_SESSIONS: usize = 1000;

/// One live SSH session as seen by the rest of the process.
pub struct SessionEntry {
    pub connection_id: String,
    pub user_id: String,
    pub host: String,
    /// Resolved peer IP, when the dial succeeded
    pub ip: Option<String>,
    pub port: u16,
    pub username: String,
    /// Host identifiers this session answers to
    pub descriptors: Vec<String>,
    pub created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    pub controller: HandleController,
}

impl SessionEntry {
    pub fn new(
        connection_id: String,
        user_id: String,
        host: String,
        ip: Option<String>,
        port: u16,
        username: String,
        controller: HandleController,
    ) -> Self {
        let descriptors = derive_descriptors(&host, ip.as_deref(), port, &username);
        Self {
            connection_id,
            user_id,
            host,
            ip,
            port,
            username,
            descriptors,
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Authenticating),
            controller,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Advance the state machine; rejects non-monotonic transitions.
    pub fn advance(&self, next: SessionState) -> Result<(), SshError> {
        let mut state = self.state.write();
        if !state.can_advance_to(next) {
            return Err(SshError::ProtocolError(format!(
                "illegal session transition {:?} -> {:?}",
                *state, next
            )));
        }
        debug!(
            "Session {} state {:?} -> {:?}",
            self.connection_id, *state, next
        );
        *state = next;
        Ok(())
    }
}

/// Derived host identifiers for one session, most specific first.
pub fn derive_descriptors(
    host: &str,
    ip: Option<&str>,
    port: u16,
    username: &str,
) -> Vec<String> {
    let mut descriptors = vec![
        host.to_string(),
        format!("{}@{}", username, host),
        format!("{}:{}", host, port),
    ];
    if let Some(ip) = ip {
        if ip != host {
            descriptors.push(ip.to_string());
            descriptors.push(format!("{}@{}", host, ip));
        }
    }
    descriptors.dedup();
    descriptors
}

/// Strip scheme, credentials and path, returning the `host[:port]` core.
fn normalize(raw: &str) -> String {
    let mut s = raw.trim().to_lowercase();
    if let Some(idx) = s.find("://") {
        s = s[idx + 3..].to_string();
    }
    // Credentials or `user@host` style prefix
    if let Some(idx) = s.rfind('@') {
        s = s[idx + 1..].to_string();
    }
    if let Some(idx) = s.find(|c| c == '/' || c == '?' || c == '#') {
        s.truncate(idx);
    }
    s
}

/// Normalized form without the port suffix.
fn bare_host(raw: &str) -> String {
    let s = normalize(raw);
    match s.rfind(':') {
        Some(idx) if s[idx + 1..].chars().all(|c| c.is_ascii_digit()) => s[..idx].to_string(),
        _ => s,
    }
}

/// Fuzzy descriptor comparison: normalized equality, bare-hostname
/// equality, or containment of one bare hostname in the other value.
pub fn descriptors_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let (na, nb) = (normalize(a), normalize(b));
    if na == nb {
        return true;
    }
    let (ba, bb) = (bare_host(a), bare_host(b));
    if !ba.is_empty() && ba == bb {
        return true;
    }
    (!bb.is_empty() && na.contains(&bb)) || (!ba.is_empty() && nb.contains(&ba))
}

/// Registry of live sessions, shared across all handler tasks.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
    /// Exact descriptor -> connection ids (fast path before the fuzzy walk)
    descriptor_index: DashMap<String, Vec<String>>,
    max_sessions: usize,
    /// Makes the limit check and insert atomic
    create_lock: Mutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            descriptor_index: DashMap::new(),
            max_sessions,
            create_lock: Mutex::new(()),
        }
    }

    /// Insert a session once it has reached `authenticating`.
    pub fn register(&self, entry: Arc<SessionEntry>) -> Result<(), SshError> {
        let _guard = self.create_lock.lock();

        let current = self.sessions.len();
        if current >= self.max_sessions {
            return Err(SshError::ServerBusy {
                current,
                max: self.max_sessions,
            });
        }

        if self.sessions.contains_key(&entry.connection_id) {
            // Connection ids are uuids; a collision means a caller bug
            warn!("Duplicate connection id {}", entry.connection_id);
            return Err(SshError::ProtocolError(format!(
                "duplicate connection id {}",
                entry.connection_id
            )));
        }

        for descriptor in &entry.descriptors {
            self.descriptor_index
                .entry(descriptor.clone())
                .or_default()
                .push(entry.connection_id.clone());
        }

        info!(
            "Session {} registered: {}@{}:{} ({} descriptors)",
            entry.connection_id,
            entry.username,
            entry.host,
            entry.port,
            entry.descriptors.len()
        );
        self.sessions.insert(entry.connection_id.clone(), entry);
        Ok(())
    }

    /// Remove a session on its terminal transition.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<SessionEntry>> {
        let (_, entry) = self.sessions.remove(connection_id)?;
        for descriptor in &entry.descriptors {
            if let Some(mut ids) = self.descriptor_index.get_mut(descriptor) {
                ids.retain(|id| id != connection_id);
                if ids.is_empty() {
                    drop(ids);
                    self.descriptor_index
                        .remove_if(descriptor, |_, ids| ids.is_empty());
                }
            }
        }
        info!("Session {} removed from registry", connection_id);
        Some(entry)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(connection_id).map(|e| e.value().clone())
    }

    /// All live sessions matching a descriptor, fuzzily.
    ///
    /// Ambiguity is allowed; callers get set semantics. The exact index is
    /// tried first, then the registry walks all live contexts.
    pub fn find_by_descriptor(&self, query: &str) -> Vec<Arc<SessionEntry>> {
        let mut out: Vec<Arc<SessionEntry>> = Vec::new();

        if let Some(ids) = self.descriptor_index.get(query) {
            for id in ids.iter() {
                if let Some(entry) = self.sessions.get(id) {
                    out.push(entry.value().clone());
                }
            }
        }

        for entry in self.sessions.iter() {
            if out
                .iter()
                .any(|e| e.connection_id == entry.value().connection_id)
            {
                continue;
            }
            if entry
                .value()
                .descriptors
                .iter()
                .any(|d| descriptors_match(d, query))
            {
                out.push(entry.value().clone());
            }
        }

        out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::handle_owner::HandleController;
    use tokio::sync::mpsc;

    fn dummy_controller() -> HandleController {
        // A controller whose owner task never existed; commands fail fast,
        // which is fine for registry tests.
        let (tx, _rx) = mpsc::channel(1);
        HandleController::new(tx)
    }

    fn entry(conn: &str, host: &str, ip: Option<&str>, user: &str) -> Arc<SessionEntry> {
        Arc::new(SessionEntry::new(
            conn.to_string(),
            "user-1".to_string(),
            host.to_string(),
            ip.map(str::to_string),
            22,
            user.to_string(),
            dummy_controller(),
        ))
    }

    #[test]
    fn descriptor_derivation() {
        let d = derive_descriptors("prod-1", Some("1.2.3.4"), 22, "alice");
        assert!(d.contains(&"prod-1".to_string()));
        assert!(d.contains(&"alice@prod-1".to_string()));
        assert!(d.contains(&"prod-1:22".to_string()));
        assert!(d.contains(&"1.2.3.4".to_string()));
        assert!(d.contains(&"prod-1@1.2.3.4".to_string()));
    }

    #[test]
    fn fuzzy_matching() {
        assert!(descriptors_match("1.2.3.4", "1.2.3.4"));
        assert!(descriptors_match("ssh://alice@prod-1/path", "prod-1"));
        assert!(descriptors_match("prod-1:2222", "prod-1"));
        assert!(descriptors_match("prod-1@1.2.3.4", "1.2.3.4"));
        assert!(descriptors_match("PROD-1", "prod-1"));
        assert!(!descriptors_match("prod-1", "prod-2"));
        assert!(!descriptors_match("", "prod-1"));
    }

    #[test]
    fn register_lookup_remove() {
        let registry = SessionRegistry::default();
        let e = entry("c1", "prod-1", Some("1.2.3.4"), "alice");
        registry.register(e.clone()).unwrap();

        assert_eq!(registry.find_by_descriptor("1.2.3.4").len(), 1);
        assert_eq!(registry.find_by_descriptor("prod-1@1.2.3.4").len(), 1);
        assert_eq!(registry.find_by_descriptor("alice@prod-1").len(), 1);
        assert!(registry.find_by_descriptor("other-host").is_empty());

        registry.remove("c1");
        assert!(registry.find_by_descriptor("1.2.3.4").is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_connection_id_rejected() {
        let registry = SessionRegistry::default();
        registry
            .register(entry("c1", "prod-1", None, "alice"))
            .unwrap();
        assert!(registry
            .register(entry("c1", "prod-2", None, "bob"))
            .is_err());
    }

    #[test]
    fn connection_limit_enforced() {
        let registry = SessionRegistry::new(1);
        registry
            .register(entry("c1", "prod-1", None, "alice"))
            .unwrap();
        assert!(matches!(
            registry.register(entry("c2", "prod-2", None, "bob")),
            Err(SshError::ServerBusy { .. })
        ));
    }

    #[test]
    fn ambiguous_descriptor_returns_all() {
        let registry = SessionRegistry::default();
        registry
            .register(entry("c1", "prod-1", Some("1.2.3.4"), "alice"))
            .unwrap();
        registry
            .register(entry("c2", "prod-1", Some("5.6.7.8"), "bob"))
            .unwrap();
        assert_eq!(registry.find_by_descriptor("prod-1").len(), 2);
    }
}
