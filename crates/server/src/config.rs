use anyhow::Result;
use gateway_protocol::GatewayConfig;

/// Load configuration from the process environment (spec.md §6):
/// `PORT`, `APP_BASE_URL`, `AI_BACKEND_URL`, `CORS_ORIGINS`, `TEMP_DIR`,
/// `WWEBJS_AUTH_DIR`, `DB_URL`. Missing variables fall back to
/// [`GatewayConfig`]'s own defaults.
pub fn load_config() -> Result<GatewayConfig> {
    let mut config = GatewayConfig::default();

    if let Ok(port) = std::env::var("PORT")
        && let Ok(parsed) = port.parse()
    {
        config.server.port = parsed;
    }

    config.server.app_base_url = std::env::var("APP_BASE_URL").ok();
    config.server.db_url = std::env::var("DB_URL").ok();

    if let Ok(origins) = std::env::var("CORS_ORIGINS") {
        config.server.cors_origins = origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    config.ai.backend_url = std::env::var("AI_BACKEND_URL").ok();

    if let Ok(temp_dir) = std::env::var("TEMP_DIR") {
        config.storage.temp_dir = temp_dir;
    }

    if let Ok(auth_dir) = std::env::var("WWEBJS_AUTH_DIR") {
        config.storage.wwebjs_auth_dir = resolve_absolute(&auth_dir);
    }

    tracing::info!("Loaded configuration from environment");
    Ok(config)
}

fn resolve_absolute(path: &str) -> String {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        path.to_string()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p).to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_absolute_leaves_absolute_paths_unchanged() {
        assert_eq!(resolve_absolute("/var/lib/wwebjs"), "/var/lib/wwebjs");
    }

    #[test]
    fn resolve_absolute_joins_relative_paths_to_cwd() {
        let resolved = resolve_absolute("wwebjs-auth");
        assert!(resolved.ends_with("wwebjs-auth"));
        assert!(std::path::Path::new(&resolved).is_absolute());
    }
}
