use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gateway_protocol::GatewayError;
use serde_json::json;

/// Wraps [`GatewayError`] so it can be returned directly from an axum handler.
/// Produces the `{"error":{"code","message","traceId"}}` envelope.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let trace_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(code = self.0.code.as_str(), trace_id = %trace_id, "{}", self.0.message);
        } else {
            tracing::warn!(code = self.0.code.as_str(), trace_id = %trace_id, "{}", self.0.message);
        }

        let body = Json(json!({
            "error": {
                "code": self.0.code.as_str(),
                "message": self.0.message,
                "traceId": trace_id,
            }
        }));

        (status, body).into_response()
    }
}

pub fn invalid_payload(message: impl Into<String>) -> ApiError {
    GatewayError::invalid_payload(message).into()
}

pub fn unauthorized(message: impl Into<String>) -> ApiError {
    GatewayError::unauthorized(message).into()
}

pub fn session_not_found(message: impl Into<String>) -> ApiError {
    GatewayError::session_not_found(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_ready_maps_to_409() {
        let err: ApiError = GatewayError::session_not_ready("agent is still connecting").into();
        assert_eq!(err.0.code.http_status(), 409);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let err: ApiError = GatewayError::rate_limited("queue full").into();
        assert_eq!(err.0.code.http_status(), 429);
    }
}
