use serde::{Deserialize, Serialize};

/// Top-level gateway configuration, assembled from environment variables
/// by `gateway-server::config::load_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port the gateway listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL this instance is reachable at (used in outbound links, never parsed).
    #[serde(default)]
    pub app_base_url: Option<String>,
    /// Allowed CORS origins, comma-separated in the environment.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Postgres connection string.
    pub db_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Base URL of the AI backend, e.g. `https://ai.example.com`.
    pub backend_url: Option<String>,
    /// Hard deadline for a single `execute_run` call.
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
}

/// Per-agent token bucket parameters (spec.md §4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: f64,
    #[serde(default = "default_burst")]
    pub burst: f64,
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory under which media previews are written.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Directory under which per-agent auth stores live.
    #[serde(default = "default_auth_dir")]
    pub wwebjs_auth_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            app_base_url: None,
            cors_origins: Vec::new(),
            db_url: None,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            timeout_secs: default_ai_timeout_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: default_tokens_per_minute(),
            burst: default_burst(),
            queue_limit: default_queue_limit(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            wwebjs_auth_dir: default_auth_dir(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ai: AiConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the gateway should not
    /// start) or "WARNING:" (advisory). Mirrors the severity convention
    /// used throughout this codebase's startup checks.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: PORT must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.db_url.is_none() {
            issues.push("ERROR: DB_URL is required.".to_string());
        }

        if self.ai.backend_url.is_none() {
            issues.push(
                "WARNING: AI_BACKEND_URL is unset; agents without an endpoint_url_run override \
                 will fail every AI call."
                    .to_string(),
            );
        }

        if self.scheduler.tokens_per_minute <= 0.0 {
            issues.push("ERROR: scheduler tokens_per_minute must be > 0.".to_string());
        }
        if self.scheduler.burst <= 0.0 {
            issues.push("ERROR: scheduler burst must be > 0.".to_string());
        }
        if self.scheduler.queue_limit == 0 {
            issues.push("ERROR: scheduler queue_limit must be >= 1.".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_ai_timeout_secs() -> u64 {
    60
}
fn default_tokens_per_minute() -> f64 {
    100.0
}
fn default_burst() -> f64 {
    100.0
}
fn default_queue_limit() -> usize {
    500
}
fn default_temp_dir() -> String {
    "/tmp/wwebjs".to_string()
}
fn default_auth_dir() -> String {
    "/tmp/wwebjs-auth".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_flags_missing_db_url() {
        let config = GatewayConfig::default();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("DB_URL")));
    }

    #[test]
    fn valid_config_passes() {
        let mut config = GatewayConfig::default();
        config.server.db_url = Some("postgres://localhost/gateway".to_string());
        config.ai.backend_url = Some("https://ai.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_queue_limit_is_an_error() {
        let mut config = GatewayConfig::default();
        config.server.db_url = Some("postgres://localhost/gateway".to_string());
        config.scheduler.queue_limit = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:") && i.contains("queue_limit")));
    }
}
