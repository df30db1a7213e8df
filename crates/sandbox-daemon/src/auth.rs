//! Auth Gate: resolves the caller's identity for every protected route.
//!
//! Mirrors the teacher's header-reading helpers (`require_bearer`), but as
//! an Axum extractor so every handler simply asks for an
//! [`AuthenticatedUser`] instead of repeating the header dance. Resolution
//! order is Bearer JWT, then `X-API-Key` header, then `api_key` query
//! parameter — matching the precedence the identity layer was ported from.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
};
use sandbox_db::UserRecord;
use thiserror::Error;
use uuid::Uuid;

use crate::server::AppState;

#[derive(Debug, Error)]
pub enum AuthGateError {
    #[error("missing or invalid credentials")]
    Unauthenticated,
    #[error("account is disabled")]
    Inactive,
}

impl AuthGateError {
    pub fn status(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }
}

/// The authenticated caller, injected by extracting this type in a handler
/// signature. When `require_auth` is disabled, resolves to a fixed root
/// identity so the daemon still has a `user_id` to scope sandboxes under.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub username: String,
}

impl From<UserRecord> for AuthenticatedUser {
    fn from(record: UserRecord) -> Self {
        Self {
            id: record.id,
            username: record.username,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    Arc<AppState>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = Arc::<AppState>::from_ref(state);

        if !state.config.auth.require_auth {
            return Ok(AuthenticatedUser {
                id: state.config.auth.default_user_id,
                username: "root".to_string(),
            });
        }

        if let Some(token) = bearer_token(parts) {
            if let Some(claims) = state.identity.decode_token(&token) {
                if let Ok(Some(user)) = state.identity.user_by_claims(&claims).await {
                    if user.is_active {
                        return Ok(user.into());
                    }
                }
            }
        }

        if let Some(api_key) = header_api_key(parts).or_else(|| query_api_key(parts)) {
            if let Ok(Some(user)) = state.identity.user_by_api_key(&api_key).await {
                if user.is_active {
                    return Ok(user.into());
                }
            }
        }

        Err((StatusCode::UNAUTHORIZED, "authentication required"))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

fn header_api_key(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn query_api_key(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "api_key").then(|| value.to_string())
    })
}
