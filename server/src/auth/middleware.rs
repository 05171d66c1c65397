//! Bearer token extraction.
//!
//! Peers authenticate with a shared secret. When `AUTH_SECRET` is unset every
//! request is accepted as anonymous.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::AppState;

/// Authenticated peer extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// Presented the configured secret.
    Peer,
    /// No secret is configured.
    Anonymous,
}

impl AuthUser {
    fn check(header: Option<&str>, secret: Option<&str>) -> Result<Self, (StatusCode, &'static str)> {
        let Some(secret) = secret else {
            return Ok(AuthUser::Anonymous);
        };
        match header {
            Some(header) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ");
                if token.is_empty() {
                    return Err((StatusCode::UNAUTHORIZED, "Empty bearer token"));
                }
                if token != secret {
                    return Err((StatusCode::UNAUTHORIZED, "Invalid bearer token"));
                }
                Ok(AuthUser::Peer)
            }
            Some(_) => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )),
            None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        AuthUser::check(header, state.config.auth_secret.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_without_secret() {
        assert_eq!(AuthUser::check(None, None), Ok(AuthUser::Anonymous));
        assert_eq!(AuthUser::check(Some("Bearer whatever"), None), Ok(AuthUser::Anonymous));
    }

    #[test]
    fn secret_must_match() {
        let secret = Some("s3cret");
        assert_eq!(AuthUser::check(Some("Bearer s3cret"), secret), Ok(AuthUser::Peer));
        assert!(AuthUser::check(Some("Bearer nope"), secret).is_err());
        assert!(AuthUser::check(Some("Bearer "), secret).is_err());
        assert!(AuthUser::check(Some("Basic s3cret"), secret).is_err());
        assert!(AuthUser::check(None, secret).is_err());
    }
}
