//! Caller identity extraction
//!
//! Authentication lives in the upstream gateway; requests reaching this
//! service carry the already-verified owner id in the `X-Owner-Id` header.

use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use impactline_shared::OwnerId;

use crate::error::ApiError;

pub const OWNER_ID_HEADER: &str = "x-owner-id";

/// The authenticated owner making this request.
#[derive(Debug, Clone, Copy)]
pub struct AuthOwner(pub OwnerId);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthOwner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let uuid: Uuid = raw.parse().map_err(|_| ApiError::Unauthorized)?;
        Ok(AuthOwner(OwnerId(uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<AuthOwner, ApiError> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(OWNER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthOwner::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_valid_header_yields_owner() {
        let id = Uuid::new_v4();
        let owner = extract(Some(&id.to_string())).await.unwrap();
        assert_eq!(owner.0, OwnerId(id));
    }

    #[tokio::test]
    async fn test_missing_or_malformed_header_is_unauthorized() {
        assert!(matches!(extract(None).await, Err(ApiError::Unauthorized)));
        assert!(matches!(
            extract(Some("not-a-uuid")).await,
            Err(ApiError::Unauthorized)
        ));
    }
}
