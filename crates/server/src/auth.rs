use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{unauthorized, ApiError};
use crate::web::AppState;

/// Bearer-auth middleware for `/agents/{agentId}/...` routes. Looks the
/// presented token up against the agent's persisted `api_key` rather than
/// validating a signed token.
///
/// On mismatch, schedules a fire-and-forget background refresh from the
/// user's latest active key (spec.md §9 "API-key lazy sync") — the current
/// request still fails 401 regardless of what that refresh finds.
pub async fn require_agent_bearer(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("missing bearer token"))?;

    let record = state
        .db
        .get_agent(&agent_id)
        .await
        .map_err(|e| unauthorized(format!("agent lookup failed: {e}")))?
        .ok_or_else(|| unauthorized("unknown agent"))?;

    if !constant_time_eq(record.api_key.as_bytes(), token.as_bytes()) {
        let db = state.db.clone();
        let user_id = record.user_id;
        let agent_id_for_sync = agent_id.clone();
        tokio::spawn(async move {
            if let Err(e) = db.sync_api_key(user_id, &agent_id_for_sync).await {
                tracing::warn!(agent_id = %agent_id_for_sync, "api key lazy sync failed: {e}");
            }
        });
        return Err(unauthorized("bearer does not match the agent's api key"));
    }

    Ok(next.run(request).await)
}

/// Constant-time byte comparison, guarding the bearer check against timing
/// side-channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer-token"));
    }

    #[test]
    fn constant_time_eq_accepts_identical_tokens() {
        assert!(constant_time_eq(b"same-token", b"same-token"));
    }

    #[test]
    fn constant_time_eq_rejects_near_miss() {
        assert!(!constant_time_eq(b"token-a", b"token-b"));
    }
}
