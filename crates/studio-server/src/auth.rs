//! Authenticated identity extraction.
//!
//! Authentication itself (JWT validation, sessions) happens upstream at the
//! gateway; requests reach this service with the verified identity in the
//! `x-user-id` header. The extractor only enforces its presence.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

/// Header the gateway injects after authentication.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller.
#[derive(Clone, Debug)]
pub struct AuthedUser(pub String);

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(|value| Self(value.to_string()))
            .ok_or_else(|| ApiError::unauthorized("missing authenticated identity"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<AuthedUser, ApiError> {
        let (mut parts, ()) = request.into_parts();
        AuthedUser::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn present_header_extracts() {
        let request = Request::builder()
            .header(USER_ID_HEADER, "u1")
            .body(())
            .unwrap();
        let user = extract(request).await.unwrap();
        assert_eq!(user.0, "u1");
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let request = Request::builder().body(()).unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_header_is_unauthorized() {
        let request = Request::builder()
            .header(USER_ID_HEADER, "")
            .body(())
            .unwrap();
        assert!(extract(request).await.is_err());
    }
}
