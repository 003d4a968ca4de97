use serde::Serialize;
use thiserror::Error;

/// Error taxonomy from spec.md §7. Each variant maps to exactly one HTTP
/// status in the gateway's boundary translation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[error("invalid payload")]
    InvalidPayload,
    #[error("unauthorized")]
    Unauthorized,
    #[error("session not found")]
    SessionNotFound,
    #[error("session not ready")]
    SessionNotReady,
    #[error("media too large")]
    MediaTooLarge,
    #[error("rate limited")]
    RateLimited,
    #[error("bad gateway")]
    BadGateway,
    #[error("AI downstream error")]
    AiDownstreamError,
    #[error("AI timeout")]
    AiTimeout,
}

impl ErrorCode {
    /// Numeric HTTP status per spec.md §7's table.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidPayload => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::SessionNotFound => 404,
            ErrorCode::SessionNotReady => 409,
            ErrorCode::MediaTooLarge => 413,
            ErrorCode::RateLimited => 429,
            ErrorCode::BadGateway => 502,
            ErrorCode::AiDownstreamError => 502,
            ErrorCode::AiTimeout => 504,
        }
    }

    /// Stable screaming-snake string used in the JSON error envelope and as
    /// a Prometheus label value.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionNotReady => "SESSION_NOT_READY",
            ErrorCode::MediaTooLarge => "MEDIA_TOO_LARGE",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::BadGateway => "BAD_GATEWAY",
            ErrorCode::AiDownstreamError => "AI_DOWNSTREAM_ERROR",
            ErrorCode::AiTimeout => "AI_TIMEOUT",
        }
    }
}

/// Core error type threaded through the supervisor, scheduler, dispatcher,
/// and proxy. Carries a human message alongside its stable `ErrorCode`.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

macro_rules! ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new(ErrorCode::$code, message)
        }
    };
}

impl GatewayError {
    ctor!(invalid_payload, InvalidPayload);
    ctor!(unauthorized, Unauthorized);
    ctor!(session_not_found, SessionNotFound);
    ctor!(session_not_ready, SessionNotReady);
    ctor!(media_too_large, MediaTooLarge);
    ctor!(rate_limited, RateLimited);
    ctor!(bad_gateway, BadGateway);
    ctor!(ai_downstream_error, AiDownstreamError);
    ctor!(ai_timeout, AiTimeout);
}
