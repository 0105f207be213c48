use super::{Identity, SessionStore};
use crate::store::StoreClient;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-attempt authentication state.
///
/// ```text
/// Unauthenticated ──submit──► Authenticating ──resolve(true)──► Authenticated
///        ▲                           │
///        └────────reset──── Rejected ◄──resolve(false)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Unauthenticated,
    Authenticating { user: String },
    Authenticated { user: String },
    Rejected { user: String },
}

impl GateState {
    /// Credentials were submitted.
    pub fn submit(self, user: &str) -> Self {
        match self {
            GateState::Unauthenticated => GateState::Authenticating {
                user: user.to_string(),
            },
            other => other,
        }
    }

    /// The credential check answered.
    pub fn resolve(self, accepted: bool) -> Self {
        match self {
            GateState::Authenticating { user } if accepted => GateState::Authenticated { user },
            GateState::Authenticating { user } => GateState::Rejected { user },
            other => other,
        }
    }

    /// A rejected attempt goes back to the start.
    pub fn reset(self) -> Self {
        match self {
            GateState::Rejected { .. } => GateState::Unauthenticated,
            other => other,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, GateState::Authenticated { .. })
    }
}

/// Result of a login attempt. `token` is set only when authenticated.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub state: GateState,
    pub token: Option<String>,
}

/// Authentication boundary in front of the broadcast hub.
///
/// Credential checks are delegated to the store. When disabled, every
/// connection is treated as already authenticated.
pub struct SessionGate {
    enabled: bool,
    store: Arc<dyn StoreClient>,
    sessions: SessionStore,
}

impl SessionGate {
    pub fn new(enabled: bool, store: Arc<dyn StoreClient>, sessions: SessionStore) -> Self {
        Self {
            enabled,
            store,
            sessions,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Run one credential exchange.
    ///
    /// A failing credential check counts as a rejection; the caller cannot
    /// tell a wrong password from an unavailable store.
    pub async fn login(&self, user: &str, secret: &str) -> LoginOutcome {
        let state = GateState::Unauthenticated.submit(user);

        let accepted = match self.store.check_credential(user, secret).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Credential check for {} failed: {}", user, e);
                false
            }
        };

        let state = state.resolve(accepted);
        let token = match &state {
            GateState::Authenticated { user } => {
                info!("Login succeeded for {}", user);
                Some(self.sessions.create(user))
            }
            _ => {
                warn!("Login rejected for {}", user);
                None
            }
        };

        LoginOutcome { state, token }
    }

    pub fn logout(&self, token: &str) {
        if self.sessions.revoke(token) {
            info!("Session logged out");
        }
    }

    /// Resolve the identity behind a session token.
    pub fn identify(&self, token: Option<&str>) -> Option<Identity> {
        if !self.enabled {
            return Some(Identity::Open);
        }
        let info = self.sessions.validate(token?)?;
        Some(Identity::User(info.user))
    }
}
