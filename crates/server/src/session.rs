use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use gateway_protocol::{AgentRecord, GatewayError, QrPayload, SessionStatus, StatusView};
use tokio::sync::{Mutex, Notify, RwLock};

use crate::chat_client::{ChatClient, ClientEvent};
use crate::db::Db;
use crate::metrics::Metrics;
use crate::scheduler::Scheduler;

const QR_WAIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
const RECORD_STALE_AFTER: chrono::Duration = chrono::Duration::seconds(60);

/// Factory for chat-network clients, injected so the supervisor never
/// depends on a concrete browser-driven implementation. Receives the sending
/// half of an event channel the client must forward `qr|ready|auth_failure|
/// disconnected|message` events into as they occur.
pub type ClientFactory =
    Arc<dyn Fn(String, tokio::sync::mpsc::UnboundedSender<ClientEvent>) -> Arc<dyn ChatClient> + Send + Sync>;

/// In-memory state for one live agent (spec.md §3 `LiveSession`).
struct LiveSession {
    record: AgentRecord,
    record_refreshed_at: std::time::Instant,
    client: Arc<dyn ChatClient>,
    qr: Option<QrPayload>,
    qr_updated_at: Option<chrono::DateTime<Utc>>,
    is_ready: bool,
    status: SessionStatus,
    shutting_down: bool,
    metrics_counted: bool,
    qr_waiter: Option<Arc<Notify>>,
    /// Count of callers currently parked on `qr_waiter`. Only the waiter that
    /// brings this to zero (or `on_qr`/`teardown`, which always own the slot
    /// outright) may clear `qr_waiter` — otherwise a timing-out waiter could
    /// destructively clear a slot a second, still-waiting joiner depends on.
    qr_waiter_count: usize,
    reconnect_scheduled: bool,
    /// Abort handle for the timer spawned by `schedule_restart`, so
    /// `teardown` can cancel it instead of letting a stale timer fire against
    /// a session that's since been explicitly torn down and recreated.
    reconnect_timer: Option<tokio::task::AbortHandle>,
    /// Set by `teardown` before it notifies a pending QR waiter, so the
    /// waiter's wakeup is distinguishable from "a QR actually arrived".
    torn_down: bool,
}

/// Per-agent state machine, client lifecycle, reconnect backoff, and QR
/// rendezvous (spec.md §4.1). Exactly one [`LiveSession`] exists per
/// `agent_id` at any instant; all mutations happen under its own lock.
pub struct Supervisor {
    sessions: RwLock<HashMap<String, Arc<Mutex<LiveSession>>>>,
    db: Db,
    metrics: Arc<Metrics>,
    scheduler: Arc<Scheduler>,
    client_factory: ClientFactory,
    auth_dir: String,
    ai_backend_url: Option<String>,
    shutting_down: std::sync::atomic::AtomicBool,
    dispatcher: tokio::sync::OnceCell<Arc<crate::dispatcher::Dispatcher>>,
}

impl Supervisor {
    pub fn new(
        db: Db,
        metrics: Arc<Metrics>,
        scheduler: Arc<Scheduler>,
        client_factory: ClientFactory,
        auth_dir: String,
        ai_backend_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            db,
            metrics,
            scheduler,
            client_factory,
            auth_dir,
            ai_backend_url,
            shutting_down: std::sync::atomic::AtomicBool::new(false),
            dispatcher: tokio::sync::OnceCell::new(),
        })
    }

    /// Wires the inbound dispatcher in after construction, breaking the
    /// otherwise-circular `Supervisor` <-> `Dispatcher` initialization order.
    pub fn set_dispatcher(&self, dispatcher: Arc<crate::dispatcher::Dispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    fn auth_dir_for(&self, agent_id: &str) -> String {
        format!("{}/session-{agent_id}", self.auth_dir)
    }

    /// Resolves the effective API key (prefer latest active key for
    /// `user_id`; fall back to `api_key`), upserts the record, and ensures a
    /// live session exists.
    pub async fn create_or_resume(
        self: &Arc<Self>,
        user_id: i64,
        agent_id: &str,
        agent_name: &str,
        api_key: Option<&str>,
    ) -> Result<StatusView, GatewayError> {
        let resolved_key = match self.db.latest_active_api_key(user_id).await {
            Ok(Some(key)) => Some(key.access_token),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(agent_id, "failed to look up latest active api key: {e}");
                None
            }
        }
        .or_else(|| api_key.map(|s| s.to_string()));

        let Some(resolved_key) = resolved_key else {
            return Err(GatewayError::invalid_payload(
                "no API key available: supply one or register an active key for this user",
            ));
        };

        // `upsert_agent` only fills `endpoint_url_run` when it's currently
        // null, so a derived default here never clobbers a prior override.
        let default_endpoint = self
            .ai_backend_url
            .as_deref()
            .map(|url| crate::ai_proxy::default_endpoint(url, agent_id));

        let record = self
            .db
            .upsert_agent(user_id, agent_id, agent_name, &resolved_key, default_endpoint.as_deref())
            .await
            .map_err(|e| GatewayError::invalid_payload(format!("failed to persist agent: {e}")))?;

        self.ensure_client(record).await
    }

    pub async fn get_status(&self, agent_id: &str) -> Result<StatusView, GatewayError> {
        if let Some(session) = self.sessions.read().await.get(agent_id) {
            let guard = session.lock().await;
            return Ok(status_view(agent_id, &guard));
        }

        let record = self
            .db
            .get_agent(agent_id)
            .await
            .map_err(|e| GatewayError::invalid_payload(format!("lookup failed: {e}")))?
            .ok_or_else(|| GatewayError::session_not_found(format!("no agent '{agent_id}'")))?;

        Ok(StatusView {
            agent_id: agent_id.to_string(),
            status: record.status,
            is_ready: false,
            qr: None,
            qr_updated_at: None,
        })
    }

    pub async fn reconnect(self: &Arc<Self>, agent_id: &str) -> Result<StatusView, GatewayError> {
        self.teardown(agent_id, true, true).await;

        let record = self
            .db
            .get_agent(agent_id)
            .await
            .map_err(|e| GatewayError::invalid_payload(format!("lookup failed: {e}")))?
            .ok_or_else(|| GatewayError::session_not_found(format!("no agent '{agent_id}'")))?;

        self.ensure_client(record).await
    }

    /// Idempotent: if no record exists, still performs best-effort teardown
    /// and reports `{deleted:false, already_removed:true}`.
    pub async fn delete(&self, agent_id: &str) -> (bool, bool) {
        self.teardown(agent_id, false, true).await;

        match self.db.delete_agent(agent_id).await {
            Ok(true) => (true, false),
            Ok(false) => (false, true),
            Err(e) => {
                tracing::error!(agent_id, "failed to delete agent row: {e}");
                (false, true)
            }
        }
    }

    /// Ensures a client, then waits for a QR per the single-waiter
    /// rendezvous. If one is already cached it returns synchronously.
    pub async fn generate_qr(self: &Arc<Self>, agent_id: &str) -> Result<StatusView, GatewayError> {
        let record = self
            .db
            .get_agent(agent_id)
            .await
            .map_err(|e| GatewayError::invalid_payload(format!("lookup failed: {e}")))?
            .ok_or_else(|| GatewayError::session_not_found(format!("no agent '{agent_id}'")))?;

        self.ensure_client(record).await?;
        self.wait_for_qr(agent_id, QR_WAIT_TIMEOUT).await
    }

    pub async fn send_text(
        self: &Arc<Self>,
        agent_id: &str,
        to: &str,
        message: &str,
        quoted_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let to = crate::jid::normalize_jid(to)?;
        let session = self.require_ready_session(agent_id).await?;

        let client = {
            let guard = session.lock().await;
            Arc::clone(&guard.client)
        };

        let message = message.to_string();
        let quoted_id = quoted_id.map(|s| s.to_string());
        let agent_id_owned = agent_id.to_string();
        let metrics = Arc::clone(&self.metrics);

        self.scheduler
            .enqueue(agent_id, async move {
                client
                    .send_message(&to, &message, quoted_id.as_deref())
                    .await
                    .map_err(|e| GatewayError::bad_gateway(format!("send_message failed: {e}")))?;
                metrics
                    .messages_sent_total
                    .with_label_values(&[&agent_id_owned])
                    .inc();
                Ok(())
            })
            .await
    }

    pub async fn send_media(
        self: &Arc<Self>,
        agent_id: &str,
        to: &str,
        media: crate::chat_client::MediaHandle,
        caption: Option<&str>,
    ) -> Result<(), GatewayError> {
        let to = crate::jid::normalize_jid(to)?;
        let session = self.require_ready_session(agent_id).await?;

        let client = {
            let guard = session.lock().await;
            Arc::clone(&guard.client)
        };

        let caption = caption.map(|s| s.to_string());
        let agent_id_owned = agent_id.to_string();
        let metrics = Arc::clone(&self.metrics);

        self.scheduler
            .enqueue(agent_id, async move {
                client
                    .send_media(&to, &media, caption.as_deref())
                    .await
                    .map_err(|e| GatewayError::bad_gateway(format!("send_media failed: {e}")))?;
                metrics
                    .messages_sent_total
                    .with_label_values(&[&agent_id_owned])
                    .inc();
                Ok(())
            })
            .await
    }

    async fn require_ready_session(&self, agent_id: &str) -> Result<Arc<Mutex<LiveSession>>, GatewayError> {
        let session = self
            .sessions
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| GatewayError::session_not_ready(format!("no live session for '{agent_id}'")))?;

        let is_ready = session.lock().await.is_ready;
        if !is_ready {
            return Err(GatewayError::session_not_ready(format!(
                "agent '{agent_id}' is not connected"
            )));
        }

        Ok(session)
    }

    /// Idempotent: a [`LiveSession`] is constructed lazily on first need.
    async fn ensure_client(self: &Arc<Self>, record: AgentRecord) -> Result<StatusView, GatewayError> {
        let agent_id = record.agent_id.clone();

        if let Some(existing) = self.sessions.read().await.get(&agent_id) {
            let mut guard = existing.lock().await;
            guard.record = record;
            guard.record_refreshed_at = std::time::Instant::now();
            return Ok(status_view(&agent_id, &guard));
        }

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let client = (self.client_factory)(agent_id.clone(), event_tx);
        let live = Arc::new(Mutex::new(LiveSession {
            record: record.clone(),
            record_refreshed_at: std::time::Instant::now(),
            client: Arc::clone(&client),
            qr: None,
            qr_updated_at: None,
            is_ready: false,
            status: record.status,
            shutting_down: false,
            metrics_counted: false,
            qr_waiter: None,
            qr_waiter_count: 0,
            reconnect_scheduled: false,
            reconnect_timer: None,
            torn_down: false,
        }));

        self.sessions.write().await.insert(agent_id.clone(), Arc::clone(&live));

        let supervisor = Arc::clone(self);
        let pump_agent_id = agent_id.clone();
        let pump_client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    ClientEvent::Qr(raw) => supervisor.on_qr(&pump_agent_id, &raw).await,
                    ClientEvent::Ready => supervisor.on_ready(&pump_agent_id).await,
                    ClientEvent::AuthFailure(msg) => supervisor.on_auth_failure(&pump_agent_id, &msg).await,
                    ClientEvent::Disconnected(reason) => supervisor.on_disconnected(&pump_agent_id, &reason).await,
                    ClientEvent::Message(message) => {
                        if let Some(dispatcher) = supervisor.dispatcher.get() {
                            let dispatcher = Arc::clone(dispatcher);
                            let client = Arc::clone(&pump_client);
                            let agent_id = pump_agent_id.clone();
                            tokio::spawn(async move {
                                dispatcher.handle_message(&agent_id, client, message).await;
                            });
                        }
                    }
                }
            }
        });

        if let Err(e) = client.initialize().await {
            tracing::warn!(agent_id, "client initialize failed: {e}");
        }

        let view = {
            let guard = live.lock().await;
            status_view(&agent_id, &guard)
        };
        Ok(view)
    }

    /// Re-check cached QR after each notification rather than resolve on a
    /// single future, so a second concurrent waiter joins the same rendezvous
    /// instead of installing its own. Also re-checks `torn_down` on every
    /// wake, since `teardown` notifies this same `Notify` and a wakeup alone
    /// can't be told apart from a real QR arriving. Only the joiner that
    /// brings `qr_waiter_count` to zero clears the slot — a waiter that
    /// merely times out while another is still parked on the same `Notify`
    /// must leave it in place, or the survivor silently loses its wakeup and
    /// blocks out its own full timeout instead.
    async fn wait_for_qr(
        &self,
        agent_id: &str,
        timeout: std::time::Duration,
    ) -> Result<StatusView, GatewayError> {
        let session = self
            .sessions
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| GatewayError::session_not_found(format!("no agent '{agent_id}'")))?;

        let notify = {
            let mut guard = session.lock().await;
            if guard.torn_down {
                return Err(GatewayError::session_not_ready("session was torn down"));
            }
            if guard.qr.is_some() {
                return Ok(status_view(agent_id, &guard));
            }
            let notify = match &guard.qr_waiter {
                Some(existing) => Arc::clone(existing),
                None => {
                    let notify = Arc::new(Notify::new());
                    guard.qr_waiter = Some(Arc::clone(&notify));
                    notify
                }
            };
            guard.qr_waiter_count += 1;
            notify
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let result = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break Err(GatewayError::session_not_ready("timed out waiting for QR"));
            }

            let notified = notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => {}
            }

            let guard = session.lock().await;
            if guard.torn_down {
                break Err(GatewayError::session_not_ready("session was torn down"));
            }
            if guard.qr.is_some() {
                break Ok(status_view(agent_id, &guard));
            }
        };

        let mut guard = session.lock().await;
        guard.qr_waiter_count = guard.qr_waiter_count.saturating_sub(1);
        if guard.qr_waiter_count == 0
            && let Some(existing) = &guard.qr_waiter
            && Arc::ptr_eq(existing, &notify)
        {
            guard.qr_waiter = None;
        }

        result
    }

    /// Fires on a `qr` client event: encode, cache, and wake any waiter.
    pub async fn on_qr(&self, agent_id: &str, raw: &str) {
        let Some(session) = self.sessions.read().await.get(agent_id).cloned() else {
            return;
        };

        let base64 = match encode_qr_png(raw) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(agent_id, "failed to encode QR: {e}");
                return;
            }
        };

        let waiter = {
            let mut guard = session.lock().await;
            guard.qr = Some(QrPayload::png(base64));
            guard.qr_updated_at = Some(Utc::now());
            guard.status = SessionStatus::AwaitingQr;
            guard.qr_waiter.take()
        };

        if let Err(e) = self.db.set_status(agent_id, SessionStatus::AwaitingQr, false, false).await {
            tracing::warn!(agent_id, "failed to persist awaiting_qr status: {e}");
        }

        if let Some(waiter) = waiter {
            waiter.notify_waiters();
        }
    }

    /// Fires on a `ready` client event.
    pub async fn on_ready(&self, agent_id: &str) {
        let Some(session) = self.sessions.read().await.get(agent_id).cloned() else {
            return;
        };

        {
            let mut guard = session.lock().await;
            guard.is_ready = true;
            guard.status = SessionStatus::Connected;
            if !guard.metrics_counted {
                self.metrics.sessions_active.inc();
                guard.metrics_counted = true;
            }
        }

        if let Err(e) = self.db.set_status(agent_id, SessionStatus::Connected, true, false).await {
            tracing::warn!(agent_id, "failed to persist connected status: {e}");
        }
    }

    /// Fires on an `auth_failure` client event.
    pub async fn on_auth_failure(self: &Arc<Self>, agent_id: &str, message: &str) {
        let Some(session) = self.sessions.read().await.get(agent_id).cloned() else {
            return;
        };

        {
            let mut guard = session.lock().await;
            if guard.shutting_down {
                return;
            }
            guard.is_ready = false;
            guard.status = SessionStatus::AuthFailed;
            if guard.metrics_counted {
                self.metrics.sessions_active.dec();
                guard.metrics_counted = false;
            }
        }

        if let Err(e) = self.db.set_status(agent_id, SessionStatus::AuthFailed, false, true).await {
            tracing::warn!(agent_id, "failed to persist auth_failed status: {e}");
        }

        tracing::warn!(agent_id, "auth failure: {message}");
        self.schedule_restart(agent_id, true, 1, None).await;
    }

    /// Fires on a `disconnected` client event.
    pub async fn on_disconnected(self: &Arc<Self>, agent_id: &str, reason: &str) {
        let Some(session) = self.sessions.read().await.get(agent_id).cloned() else {
            return;
        };

        {
            let mut guard = session.lock().await;
            if guard.shutting_down {
                return;
            }
            guard.is_ready = false;
            guard.status = SessionStatus::Disconnected;
            if guard.metrics_counted {
                self.metrics.sessions_active.dec();
                guard.metrics_counted = false;
            }
        }

        if let Err(e) = self.db.set_status(agent_id, SessionStatus::Disconnected, false, true).await {
            tracing::warn!(agent_id, "failed to persist disconnected status: {e}");
        }

        let clear_auth = reason.to_lowercase().contains("logout");
        self.schedule_restart(agent_id, clear_auth, 1, None).await;
    }

    /// At most one outstanding timer per agent. A fresh disconnect/auth
    /// failure uses `delay = min(30s, attempt*5s)`; a nested retry after the
    /// restart itself fails instead doubles the delay it just used, capped at
    /// 60s (spec.md §4.1).
    async fn schedule_restart(
        self: &Arc<Self>,
        agent_id: &str,
        clear_auth: bool,
        attempt: u32,
        previous_delay: Option<std::time::Duration>,
    ) {
        let Some(session) = self.sessions.read().await.get(agent_id).cloned() else {
            return;
        };

        {
            let mut guard = session.lock().await;
            if guard.reconnect_scheduled {
                return;
            }
            guard.reconnect_scheduled = true;
        }

        let delay = match previous_delay {
            Some(prev) => (prev * 2).min(std::time::Duration::from_secs(60)),
            None => std::time::Duration::from_secs((attempt as u64 * 5).min(30)),
        };
        let supervisor = Arc::clone(self);
        let agent_id = agent_id.to_string();

        let join_handle = tokio::spawn({
            let agent_id = agent_id.clone();
            async move {
                tokio::time::sleep(delay).await;

                if supervisor.shutting_down.load(std::sync::atomic::Ordering::Relaxed) {
                    return;
                }

                {
                    if let Some(session) = supervisor.sessions.read().await.get(&agent_id) {
                        let mut guard = session.lock().await;
                        guard.reconnect_scheduled = false;
                        guard.reconnect_timer = None;
                    }
                }

                let record = match supervisor.db.get_agent(&agent_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => return,
                    Err(e) => {
                        tracing::error!(agent_id, "failed to reload agent before restart: {e}");
                        Self::reschedule_after_failure(&supervisor, &agent_id, clear_auth, attempt, delay).await;
                        return;
                    }
                };

                supervisor.teardown(&agent_id, true, clear_auth).await;

                if let Err(e) = supervisor.ensure_client(record).await {
                    tracing::error!(agent_id, "failed to re-establish client: {}", e.message);
                    Self::reschedule_after_failure(&supervisor, &agent_id, clear_auth, attempt, delay).await;
                }
            }
        });

        // Stored so `teardown` can `.abort()` this timer if the session is
        // explicitly torn down (e.g. an explicit `reconnect()`/`delete()`)
        // before it fires — otherwise a stale timer reconnects a session the
        // caller already replaced minutes later.
        session.lock().await.reconnect_timer = Some(join_handle.abort_handle());
    }

    async fn reschedule_after_failure(
        supervisor: &Arc<Self>,
        agent_id: &str,
        clear_auth: bool,
        attempt: u32,
        delay_just_used: std::time::Duration,
    ) {
        supervisor
            .schedule_restart(agent_id, clear_auth, attempt.saturating_add(1), Some(delay_just_used))
            .await;
    }

    /// Cancels any pending reconnect timer, marks the session shutting down,
    /// best-effort destroys the client, decrements the gauge if counted,
    /// removes the live session (rejecting any QR waiter), and optionally
    /// clears persisted state and the on-disk auth directory.
    async fn teardown(&self, agent_id: &str, preserve_db: bool, clear_auth: bool) {
        let Some(session) = self.sessions.write().await.remove(agent_id) else {
            if !preserve_db
                && let Err(e) = self.db.set_status(agent_id, SessionStatus::Disconnected, false, true).await
            {
                tracing::warn!(agent_id, "failed to persist disconnected status on teardown: {e}");
            }
            if clear_auth {
                let _ = tokio::fs::remove_dir_all(self.auth_dir_for(agent_id)).await;
            }
            return;
        };

        let (client, waiter, metrics_counted, reconnect_timer) = {
            let mut guard = session.lock().await;
            guard.shutting_down = true;
            guard.torn_down = true;
            guard.reconnect_scheduled = false;
            (
                Arc::clone(&guard.client),
                guard.qr_waiter.take(),
                guard.metrics_counted,
                guard.reconnect_timer.take(),
            )
        };

        if let Some(timer) = reconnect_timer {
            timer.abort();
        }

        if let Err(e) = client.destroy().await {
            tracing::warn!(agent_id, "client destroy failed: {e}");
        }

        if metrics_counted {
            self.metrics.sessions_active.dec();
        }

        if let Some(waiter) = waiter {
            // `torn_down` was set above, so the woken `wait_for_qr` loop
            // rejects with `SESSION_NOT_READY` instead of waiting out the
            // rest of its deadline.
            waiter.notify_waiters();
        }

        if !preserve_db
            && let Err(e) = self.db.set_status(agent_id, SessionStatus::Disconnected, false, true).await
        {
            tracing::warn!(agent_id, "failed to persist disconnected status on teardown: {e}");
        }

        if clear_auth {
            let _ = tokio::fs::remove_dir_all(self.auth_dir_for(agent_id)).await;
        }
    }

    /// Rehydrates live sessions for every bootstrappable row at startup.
    pub async fn bootstrap(self: &Arc<Self>) -> anyhow::Result<()> {
        let records = self.db.list_bootstrappable().await?;
        for record in records {
            let agent_id = record.agent_id.clone();
            if let Err(e) = self.ensure_client(record).await {
                tracing::error!(agent_id, "failed to bootstrap agent: {}", e.message);
            }
        }
        Ok(())
    }

    /// Marks the supervisor as shutting down so in-flight reconnect timers
    /// don't keep spawning work past process shutdown. Live sessions and
    /// their auth stores are left intact — they survive the restart.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Refreshes the cached `AgentRecord` for an agent if it's stale, used by
    /// the inbound dispatcher before building an AI payload.
    pub async fn refresh_record_if_stale(&self, agent_id: &str) -> Option<AgentRecord> {
        let session = self.sessions.read().await.get(agent_id).cloned()?;
        let needs_refresh = {
            let guard = session.lock().await;
            chrono::Duration::from_std(guard.record_refreshed_at.elapsed()).unwrap_or(RECORD_STALE_AFTER)
                > RECORD_STALE_AFTER
        };

        if needs_refresh
            && let Ok(Some(fresh)) = self.db.get_agent(agent_id).await
        {
            let mut guard = session.lock().await;
            guard.record = fresh;
            guard.record_refreshed_at = std::time::Instant::now();
        }

        Some(session.lock().await.record.clone())
    }
}

fn status_view(agent_id: &str, session: &LiveSession) -> StatusView {
    StatusView {
        agent_id: agent_id.to_string(),
        status: session.status,
        is_ready: session.is_ready,
        qr: session.qr.clone(),
        qr_updated_at: session.qr_updated_at,
    }
}

const QR_MODULE_PX: u32 = 2;
const QR_MARGIN_MODULES: u32 = 2;

/// Encodes a raw QR payload as PNG, error-correction "M", and returns its
/// base64 representation. `module_dimensions`/`quiet_zone` on the `qrcode`
/// crate's renderer only control per-module pixel scale and an on/off toggle
/// for its own fixed-width border, not a quiet zone sized in modules — so the
/// true "margin 2" quiet zone is built by rendering with no built-in border
/// and hand-padding the result by 2 modules of white on every side.
fn encode_qr_png(raw: &str) -> anyhow::Result<String> {
    use image::{ImageBuffer, Luma};
    use qrcode::QrCode;

    let code = QrCode::with_error_correction_level(raw.as_bytes(), qrcode::EcLevel::M)?;
    let inner: ImageBuffer<Luma<u8>, Vec<u8>> = code
        .render::<Luma<u8>>()
        .quiet_zone(false)
        .module_dimensions(QR_MODULE_PX, QR_MODULE_PX)
        .build();

    let margin_px = QR_MARGIN_MODULES * QR_MODULE_PX;
    let mut padded: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_pixel(
        inner.width() + margin_px * 2,
        inner.height() + margin_px * 2,
        Luma([255u8]),
    );
    for (x, y, pixel) in inner.enumerate_pixels() {
        padded.put_pixel(x + margin_px, y + margin_px, *pixel);
    }

    let mut png_bytes = Vec::new();
    {
        let mut cursor = std::io::Cursor::new(&mut png_bytes);
        padded.write_to(&mut cursor, image::ImageFormat::Png)?;
    }

    Ok(BASE64.encode(&png_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_qr_png_produces_nonempty_base64() {
        let encoded = encode_qr_png("otp-string").expect("encode should succeed");
        assert!(!encoded.is_empty());
        assert!(BASE64.decode(&encoded).is_ok());
    }
}
