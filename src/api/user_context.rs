use crate::api::errors::{error_response, internal_error, unauthorized};
use crate::core::auth::{extract_bearer_token, TokenKind};
use crate::core::state::AppState;
use crate::services::user_store::UserStore;
use crate::storage::UserRecord;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

/// Resolves the caller from the bearer access token.
pub fn resolve_user(state: &AppState, headers: &HeaderMap) -> Result<UserRecord, Response> {
    let token = extract_bearer_token(headers).ok_or_else(|| unauthorized("Not authenticated"))?;
    let claims = state
        .tokens
        .verify(&token, TokenKind::Access)
        .map_err(|err| unauthorized(err.message()))?;
    let user = state
        .user_store
        .get_user(claims.uid)
        .map_err(|err| internal_error("load current user failed", err))?
        .filter(|user| user.username == claims.sub)
        .ok_or_else(|| unauthorized("Could not validate credentials"))?;
    if !user.is_active {
        return Err(error_response(StatusCode::BAD_REQUEST, "Inactive user"));
    }
    Ok(user)
}

pub fn resolve_admin(state: &AppState, headers: &HeaderMap) -> Result<UserRecord, Response> {
    let user = resolve_user(state, headers)?;
    if !UserStore::is_admin(&user) {
        return Err(error_response(
            StatusCode::FORBIDDEN,
            "Not enough permissions",
        ));
    }
    Ok(user)
}
