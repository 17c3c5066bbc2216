use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::convert::Infallible;

/// The authenticated principal. Session handling lives outside the core;
/// upstream middleware is expected to have validated the identity header.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

pub const PRINCIPAL_HEADER: &str = "x-user-id";
pub const ANONYMOUS: &str = "anonymous";

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS);
        Ok(Principal(principal.to_string()))
    }
}
