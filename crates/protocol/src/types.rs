use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection status of an agent's live chat-network session (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    AwaitingQr,
    Connected,
    Disconnected,
    AuthFailed,
}

impl SessionStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            SessionStatus::AwaitingQr => "awaiting_qr",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::AuthFailed => "auth_failed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "awaiting_qr" => Some(SessionStatus::AwaitingQr),
            "connected" => Some(SessionStatus::Connected),
            "disconnected" => Some(SessionStatus::Disconnected),
            "auth_failed" => Some(SessionStatus::AuthFailed),
            _ => None,
        }
    }
}

/// Persisted row for a tenant agent, primary keyed by `(user_id, agent_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub user_id: i64,
    pub agent_id: String,
    pub agent_name: String,
    pub api_key: String,
    pub endpoint_url_run: Option<String>,
    pub status: SessionStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only externally-owned row consulted to resolve the effective API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub user_id: i64,
    pub access_token: String,
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

/// `{contentType:"image/png", base64:string}` QR payload (spec.md §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub content_type: &'static str,
    pub base64: String,
}

impl QrPayload {
    pub fn png(base64: String) -> Self {
        Self {
            content_type: "image/png",
            base64,
        }
    }
}

/// Response shape for status-returning operations (spec.md §4.1).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub agent_id: String,
    pub status: SessionStatus,
    pub is_ready: bool,
    pub qr: Option<QrPayload>,
    pub qr_updated_at: Option<DateTime<Utc>>,
}
