//! Session identity extractors.
//!
//! The session layer itself (login, token issuance) lives elsewhere; here a
//! request is mapped to a user by looking up the session cookie's token.

use crate::{errors::AppError, models::user::User, state::AppState};
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use std::convert::Infallible;
use tracing::warn;

/// The caller, if they carry a valid session. Never rejects.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Option<User>);

impl CurrentUser {
    /// The caller, or the guest identity for anonymous requests.
    pub fn or_guest(&self) -> User {
        self.0.clone().unwrap_or_else(User::guest)
    }
}

/// The caller, who must be signed in. Rejects with 401 otherwise.
#[derive(Debug, Clone)]
pub struct RequireUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(token) = session_token(&parts.headers, &state.session_cookie) else {
            return Ok(CurrentUser(None));
        };
        let user = sqlx::query_as::<_, User>("SELECT id, username FROM users WHERE token = ?")
            .bind(token)
            .fetch_optional(&*state.db)
            .await
            .unwrap_or_else(|err| {
                warn!("session lookup failed: {}", err);
                None
            });
        Ok(CurrentUser(user))
    }
}

impl FromRequestParts<AppState> for RequireUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state)
            .await
            .unwrap_or(CurrentUser(None));
        user.map(RequireUser)
            .ok_or_else(|| AppError::unauthorized("login required"))
    }
}

/// Value of the named cookie, across all `Cookie` headers.
fn session_token<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn finds_session_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            header::COOKIE,
            HeaderValue::from_static("a=1; linkit_session=\"tok123\"; b=2"),
        );
        assert_eq!(session_token(&headers, "linkit_session"), Some("tok123"));
        assert_eq!(session_token(&headers, "missing"), None);

        let mut empty = HeaderMap::new();
        empty.insert(header::COOKIE, HeaderValue::from_static("linkit_session="));
        assert_eq!(session_token(&empty, "linkit_session"), None);
    }
}
