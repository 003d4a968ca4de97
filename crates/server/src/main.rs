mod ai_proxy;
mod auth;
mod chat_client;
mod config;
mod db;
mod dispatcher;
mod error;
mod jid;
mod media;
mod metrics;
mod scheduler;
mod session;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::chat_client::ProcessChatClient;
use crate::db::Db;
use crate::dispatcher::Dispatcher;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;
use crate::session::Supervisor;
use crate::web::AppState;

const TEMP_PREVIEW_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30 * 60);
const TEMP_PREVIEW_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            EnvFilter::new(level)
        }))
        .init();

    let config = config::load_config()?;
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let db_url = config
        .server
        .db_url
        .clone()
        .context("DB_URL must be set (already validated above)")?;
    let db = Db::connect(&db_url).await.context("failed to connect to Postgres")?;
    db.migrate().await.context("failed to run schema migration")?;

    let metrics = Arc::new(Metrics::new().context("failed to construct metrics registry")?);
    let scheduler = Scheduler::new(
        config.scheduler.tokens_per_minute,
        config.scheduler.burst,
        config.scheduler.queue_limit,
    );

    let auth_dir = config.storage.wwebjs_auth_dir.clone();
    let driver_command =
        std::env::var("WWEBJS_DRIVER_CMD").unwrap_or_else(|_| "wwebjs-driver".to_string());

    let client_factory: session::ClientFactory = {
        let auth_dir = auth_dir.clone();
        Arc::new(move |agent_id: String, events: tokio::sync::mpsc::UnboundedSender<chat_client::ClientEvent>| {
            let session_auth_dir = format!("{auth_dir}/session-{agent_id}");
            match ProcessChatClient::spawn(&driver_command, &agent_id, &session_auth_dir, events) {
                Ok(client) => Arc::new(client) as Arc<dyn chat_client::ChatClient>,
                Err(e) => {
                    tracing::error!(agent_id, "failed to spawn chat client process: {e}");
                    Arc::new(chat_client::UnavailableChatClient::new(e.to_string())) as Arc<dyn chat_client::ChatClient>
                }
            }
        })
    };

    let supervisor = Supervisor::new(
        db.clone(),
        Arc::clone(&metrics),
        Arc::clone(&scheduler),
        client_factory,
        auth_dir,
        config.ai.backend_url.clone(),
    );

    let ai_http = reqwest::Client::new();
    let bot_digits = std::env::var("BOT_DIGITS").unwrap_or_default();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&supervisor),
        Arc::clone(&scheduler),
        Arc::clone(&metrics),
        ai_http.clone(),
        config.ai.backend_url.clone().unwrap_or_default(),
        bot_digits,
    ));
    supervisor.set_dispatcher(Arc::clone(&dispatcher));

    if let Err(e) = supervisor.bootstrap().await {
        tracing::error!("failed to bootstrap existing sessions: {e}");
    }

    let temp_dir = config.storage.temp_dir.clone();
    tokio::fs::create_dir_all(&temp_dir).await.ok();
    let sweep_dir = temp_dir.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(TEMP_PREVIEW_SWEEP_INTERVAL).await;
            sweep_temp_previews(&sweep_dir, TEMP_PREVIEW_MAX_AGE).await;
        }
    });

    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
        db,
        metrics,
        ai_http,
        ai_backend_url: config.ai.backend_url.clone(),
        temp_dir,
        cors_origins: config.server.cors_origins.clone(),
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.server.port)
        .parse()
        .context("invalid bind address")?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("whatsapp gateway listening on {bind_addr}");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => { tracing::info!("received SIGINT, shutting down"); }
                _ = sigterm.recv() => { tracing::info!("received SIGTERM, shutting down"); }
            }
            supervisor.begin_shutdown();
        })
        .await
        .context("server error")?;

    tracing::info!("whatsapp gateway shut down cleanly");
    Ok(())
}

async fn sweep_temp_previews(dir: &str, max_age: std::time::Duration) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir, "failed to read temp dir for sweep: {e}");
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir, "error walking temp dir during sweep: {e}");
                break;
            }
        };

        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();

        if age > max_age
            && let Err(e) = tokio::fs::remove_file(entry.path()).await
        {
            tracing::warn!(path = %entry.path().display(), "failed to remove stale preview: {e}");
        }
    }
}
