use chrono::Utc;
use gateway_protocol::{AgentRecord, ApiKey, SessionStatus};
use sqlx::{PgPool, Row};

/// Postgres-backed persistence adapter for `AgentRecord` rows and the
/// externally-owned `api_keys` table (spec.md §4.7).
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(db_url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                user_id BIGINT NOT NULL,
                agent_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                api_key TEXT NOT NULL,
                endpoint_url_run TEXT,
                status TEXT NOT NULL,
                last_connected_at TIMESTAMPTZ,
                last_disconnected_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, agent_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                user_id BIGINT NOT NULL,
                access_token TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert on first sight with `status=awaiting_qr`; otherwise update
    /// `agent_name, api_key, endpoint_url_run` (only if currently null) and
    /// `updated_at`. Never touches `created_at` or `user_id` on an update.
    pub async fn upsert_agent(
        &self,
        user_id: i64,
        agent_id: &str,
        agent_name: &str,
        api_key: &str,
        endpoint_url_run: Option<&str>,
    ) -> anyhow::Result<AgentRecord> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO agents (
                user_id, agent_id, agent_name, api_key, endpoint_url_run,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (user_id, agent_id) DO UPDATE SET
                agent_name = EXCLUDED.agent_name,
                api_key = EXCLUDED.api_key,
                endpoint_url_run = COALESCE(agents.endpoint_url_run, EXCLUDED.endpoint_url_run),
                updated_at = EXCLUDED.updated_at
            RETURNING user_id, agent_id, agent_name, api_key, endpoint_url_run,
                      status, last_connected_at, last_disconnected_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(agent_id)
        .bind(agent_name)
        .bind(api_key)
        .bind(endpoint_url_run)
        .bind(SessionStatus::AwaitingQr.as_db_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_agent(row))
    }

    pub async fn get_agent(&self, agent_id: &str) -> anyhow::Result<Option<AgentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, agent_id, agent_name, api_key, endpoint_url_run,
                   status, last_connected_at, last_disconnected_at, created_at, updated_at
            FROM agents WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_agent))
    }

    /// Updates `status, updated_at`, plus `last_connected_at` /
    /// `last_disconnected_at` when the caller asks for them.
    pub async fn set_status(
        &self,
        agent_id: &str,
        status: SessionStatus,
        set_last_connected: bool,
        set_last_disconnected: bool,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE agents SET
                status = $2,
                updated_at = $3,
                last_connected_at = CASE WHEN $4 THEN $3 ELSE last_connected_at END,
                last_disconnected_at = CASE WHEN $5 THEN $3 ELSE last_disconnected_at END
            WHERE agent_id = $1
            "#,
        )
        .bind(agent_id)
        .bind(status.as_db_str())
        .bind(now)
        .bind(set_last_connected)
        .bind(set_last_disconnected)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_agent(&self, agent_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All rows eligible for startup rehydration.
    pub async fn list_bootstrappable(&self) -> anyhow::Result<Vec<AgentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, agent_id, agent_name, api_key, endpoint_url_run,
                   status, last_connected_at, last_disconnected_at, created_at, updated_at
            FROM agents
            WHERE status IN ('connected', 'awaiting_qr', 'disconnected')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_agent).collect())
    }

    pub async fn latest_active_api_key(&self, user_id: i64) -> anyhow::Result<Option<ApiKey>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, access_token, is_active, updated_at
            FROM api_keys
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ApiKey {
            user_id: r.get("user_id"),
            access_token: r.get("access_token"),
            is_active: r.get("is_active"),
            updated_at: r.get("updated_at"),
        }))
    }

    /// Copy the latest active key into the agent's row. Invoked
    /// fire-and-forget by the auth middleware on a bearer mismatch.
    pub async fn sync_api_key(&self, user_id: i64, agent_id: &str) -> anyhow::Result<()> {
        let Some(key) = self.latest_active_api_key(user_id).await? else {
            return Ok(());
        };

        sqlx::query("UPDATE agents SET api_key = $1, updated_at = $2 WHERE agent_id = $3 AND user_id = $4")
            .bind(&key.access_token)
            .bind(Utc::now())
            .bind(agent_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn row_to_agent(row: sqlx::postgres::PgRow) -> AgentRecord {
    let status_str: String = row.get("status");
    AgentRecord {
        user_id: row.get("user_id"),
        agent_id: row.get("agent_id"),
        agent_name: row.get("agent_name"),
        api_key: row.get("api_key"),
        endpoint_url_run: row.get("endpoint_url_run"),
        status: SessionStatus::from_db_str(&status_str).unwrap_or(SessionStatus::Disconnected),
        last_connected_at: row.get("last_connected_at"),
        last_disconnected_at: row.get("last_disconnected_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
