mod gate;
mod middleware;
mod session;

pub use gate::{GateState, LoginOutcome, SessionGate};
pub use middleware::{BasicCredentials, GateGuard, LOGIN_PAGE, SESSION_COOKIE, require_login};
pub use session::{SessionInfo, SessionStore};

use std::fmt;

/// Who a viewer is, as established by the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Authentication is disabled; every connection is trusted.
    Open,
    /// A user that passed the credential check.
    User(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Open => write!(f, "open"),
            Identity::User(user) => write!(f, "user={}", user),
        }
    }
}
