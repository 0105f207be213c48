use super::{Identity, SessionGate};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Name of the browser session cookie.
pub const SESSION_COOKIE: &str = "statemirror.sid";

/// Where unauthenticated browsers are sent.
pub const LOGIN_PAGE: &str = "/login/";

/// Fixed credentials for HTTP Basic authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Parse an `Authorization: Basic ...` header value.
    pub fn from_header(value: &str) -> Option<Self> {
        let encoded = value.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some(Self::new(user, password))
    }

    /// Compare against offered credentials without short-circuiting on the
    /// first differing byte.
    pub fn matches(&self, offered: &BasicCredentials) -> bool {
        let user = self.user.as_bytes().ct_eq(offered.user.as_bytes());
        let password = self.password.as_bytes().ct_eq(offered.password.as_bytes());
        (user & password).into()
    }

    /// Encode as an `Authorization` header value.
    pub fn to_header(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.user, self.password))
        )
    }
}

/// Middleware state: the session gate, plus fixed Basic credentials on
/// listeners that use them instead of cookies.
#[derive(Clone)]
pub struct GateGuard {
    pub gate: Arc<SessionGate>,
    pub basic: Option<Arc<BasicCredentials>>,
}

impl GateGuard {
    pub fn new(gate: Arc<SessionGate>) -> Self {
        Self { gate, basic: None }
    }

    pub fn with_basic(mut self, basic: Option<BasicCredentials>) -> Self {
        self.basic = basic.map(Arc::new);
        self
    }
}

fn is_public(path: &str) -> bool {
    path == "/login" || path.starts_with("/login/") || path == "/health"
}

fn is_machine_client(request: &Request<Body>) -> bool {
    request.uri().path().starts_with("/api/")
        || request
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn basic_identity(headers: &HeaderMap, expected: &BasicCredentials) -> Option<Identity> {
    let offered = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(BasicCredentials::from_header)?;
    expected.matches(&offered).then(|| Identity::User(offered.user))
}

fn basic_challenge() -> Response {
    let mut response = StatusCode::UNAUTHORIZED.into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"statemirror\""),
    );
    response
}

/// Login-required gate for every route.
///
/// On success the caller's [`Identity`] is stored in the request extensions.
pub async fn require_login(
    State(guard): State<GateGuard>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !guard.gate.is_enabled() {
        request.extensions_mut().insert(Identity::Open);
        return next.run(request).await;
    }

    if is_public(request.uri().path()) {
        return next.run(request).await;
    }

    if let Some(expected) = &guard.basic {
        return match basic_identity(request.headers(), expected) {
            Some(identity) => {
                request.extensions_mut().insert(identity);
                next.run(request).await
            }
            None => {
                warn!("Basic auth rejected for {}", request.uri().path());
                basic_challenge()
            }
        };
    }

    let token = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    match guard.gate.identify(token.as_deref()) {
        Some(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        None if is_machine_client(&request) => {
            debug!("Unauthenticated request to {}", request.uri().path());
            StatusCode::UNAUTHORIZED.into_response()
        }
        None => Redirect::to(LOGIN_PAGE).into_response(),
    }
}
