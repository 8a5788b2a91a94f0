//! Bearer-token authentication.

use crate::{errors::AppError, services::token_service::hash_token, state::AppState};
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use uuid::Uuid;

/// The user a request is acting for, resolved from `Authorization: Bearer`.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;

        match state.store.find_user_by_token_hash(&hash_token(token)).await? {
            Some(user_id) => Ok(AuthUser(user_id)),
            None => Err(AppError::unauthorized("invalid bearer token")),
        }
    }
}
