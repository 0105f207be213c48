use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;

/// A logged-in browser session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory session table keyed by opaque cookie token.
///
/// Sessions live only as long as the process.
pub struct SessionStore {
    sessions: DashMap<String, SessionInfo>,
    lifetime: Duration,
}

impl SessionStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            lifetime,
        }
    }

    /// Create a session for `user` and return its token.
    pub fn create(&self, user: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let now = Utc::now();
        self.sessions.insert(
            token.clone(),
            SessionInfo {
                user: user.to_string(),
                created_at: now,
                expires_at: now + self.lifetime,
            },
        );
        token
    }

    /// Look up a live session. Expired sessions are removed on sight.
    pub fn validate(&self, token: &str) -> Option<SessionInfo> {
        let info = self.sessions.get(token)?.clone();
        if info.expires_at <= Utc::now() {
            self.sessions.remove(token);
            return None;
        }
        Some(info)
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, info| info.expires_at > now);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
