use super::AppState;
use crate::auth::{GateState, LOGIN_PAGE, SESSION_COOKIE};
use axum::{
    Form, Router,
    extract::State,
    response::Redirect,
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use tracing::debug;

/// Login form fields.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", get(logout))
}

/// POST /login
async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> (CookieJar, Redirect) {
    let outcome = state.gate.login(&form.username, &form.password).await;

    match (outcome.state, outcome.token) {
        (GateState::Authenticated { .. }, Some(token)) => {
            let cookie = Cookie::build((SESSION_COOKIE, token))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            (jar.add(cookie), Redirect::to("/"))
        }
        (attempt, _) => {
            // Back to the form for another attempt.
            debug!("Login attempt returns to {:?}", attempt.reset());
            (jar, Redirect::to("/login"))
        }
    }
}

/// GET /logout
async fn logout(State(state): State<AppState>, jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.gate.logout(cookie.value());
    }
    let jar = jar.remove(Cookie::build(SESSION_COOKIE).path("/"));
    (jar, Redirect::to(LOGIN_PAGE))
}
