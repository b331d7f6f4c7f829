//! Credential extraction and principal lookup for HTTP requests.
//!
//! A client presents its session token either as `Authorization: Bearer
//! <token>` or, for `EventSource` clients that cannot set headers, as a
//! `token` query parameter. The header wins when both are present.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::model::Principal;
use crate::store::IdentityResolver;

/// Query parameters that may carry a credential.
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Pull the session token from the request, if any.
pub fn credential(headers: &HeaderMap, query: &TokenQuery) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    from_header
        .map(str::to_string)
        .or_else(|| query.token.clone().filter(|t| !t.is_empty()))
}

/// Resolve the caller of a control API request.
///
/// The pooled connection is borrowed on a blocking thread for the lookup
/// only.
pub async fn authenticate(
    identity: &Arc<dyn IdentityResolver>,
    credential: Option<String>,
) -> Result<Principal, ApiError> {
    let token = credential.ok_or(ApiError::Unauthorized)?;
    let identity = Arc::clone(identity);
    let resolved = tokio::task::spawn_blocking(move || identity.resolve(&token)).await?;
    resolved.map_err(ApiError::from)
}

/// Resolve the caller and require the admin role.
pub async fn authenticate_admin(
    identity: &Arc<dyn IdentityResolver>,
    credential: Option<String>,
) -> Result<Principal, ApiError> {
    let principal = authenticate(identity, credential).await?;
    if principal.is_admin() {
        Ok(principal)
    } else {
        tracing::warn!(user_id = %principal.user_id, "Admin endpoint refused");
        Err(ApiError::Forbidden)
    }
}
