use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::routes::ApiError;
use crate::AppState;

pub(crate) const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub sub: String,
    pub exp: u64,
}

/// Caller identity. Only conversation ownership depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthUser(pub String);

/// Resolve the user id from an `Authorization` header value. With no secret
/// configured every caller is anonymous.
pub(crate) fn verify(secret: &str, header: Option<&str>) -> Result<String, ApiError> {
    if secret.is_empty() {
        return Ok(ANONYMOUS.to_string());
    }
    let token = header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        tracing::debug!("rejected token: {e}");
        ApiError::unauthorized("invalid token")
    })?;
    if data.claims.sub.is_empty() {
        return Err(ApiError::unauthorized("token has no subject"));
    }
    Ok(data.claims.sub)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
        verify(&state.config.jwt_secret, header).map(AuthUser)
    }
}

#[cfg(test)]
pub(crate) fn token_for(secret: &str, sub: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = Claims {
        sub: sub.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as u64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}
