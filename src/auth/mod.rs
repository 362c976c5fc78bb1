//! PSK-based authentication and caller identity.
//!
//! Implements constant-time comparison to mitigate timing attacks.

use axum::{
    extract::{FromRequestParts, Request},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::errors::SyncError;

/// Header name for the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header naming the user on whose behalf the request is made.
pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_USER_ID_LEN: usize = 128;

/// PSK authentication layer function that takes the expected PSK as a parameter.
pub async fn psk_auth_layer(
    expected_psk: Option<String>,
    request: Request,
    next: Next,
) -> Response {
    // If no PSK is configured, allow all requests (dev mode)
    let Some(expected) = expected_psk else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    match provided {
        Some(provided_key) => {
            if constant_time_compare(&provided_key, &expected) {
                next.run(request).await
            } else {
                unauthorized_response("Invalid API key")
            }
        }
        None => {
            // Also check Authorization header as bearer token
            let bearer = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
                .map(|s| s.to_string());

            match bearer {
                Some(bearer_key) if constant_time_compare(&bearer_key, &expected) => {
                    next.run(request).await
                }
                _ => unauthorized_response("Missing or invalid API key"),
            }
        }
    }
}

/// The user every record operation of a request is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = SyncError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        if user_id.is_empty() {
            return Err(SyncError::Unauthorized(format!(
                "Missing {} header",
                USER_ID_HEADER
            )));
        }
        if user_id.len() > MAX_USER_ID_LEN {
            return Err(SyncError::BadRequest("User id is too long".to_string()));
        }

        Ok(Owner(user_id.to_string()))
    }
}

/// Perform constant-time string comparison.
fn constant_time_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn unauthorized_response(message: &str) -> Response {
    SyncError::Unauthorized(message.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare("test-key-123", "test-key-123"));
    }

    #[test]
    fn test_constant_time_compare_not_equal() {
        assert!(!constant_time_compare("test-key-123", "test-key-124"));
    }

    #[test]
    fn test_constant_time_compare_different_lengths() {
        assert!(!constant_time_compare("short", "much-longer-key"));
    }

    #[test]
    fn test_constant_time_compare_empty() {
        assert!(constant_time_compare("", ""));
        assert!(!constant_time_compare("", "not-empty"));
    }

    fn guarded_router() -> Router {
        let psk = Some("secret".to_string());
        Router::new()
            .route("/whoami", get(|Owner(user): Owner| async move { user }))
            .layer(middleware::from_fn(move |req, next| {
                psk_auth_layer(psk.clone(), req, next)
            }))
    }

    #[tokio::test]
    async fn bearer_tokens_are_accepted() {
        let response = guarded_router()
            .oneshot(
                HttpRequest::get("/whoami")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .header(USER_ID_HEADER, "u-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_keys_and_missing_identity_are_rejected() {
        let response = guarded_router()
            .oneshot(
                HttpRequest::get("/whoami")
                    .header(API_KEY_HEADER, "wrong")
                    .header(USER_ID_HEADER, "u-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = guarded_router()
            .oneshot(
                HttpRequest::get("/whoami")
                    .header(API_KEY_HEADER, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
