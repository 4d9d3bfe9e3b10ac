use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{Connection, PgConnection, PgPool, Row};
use tracing::{debug, warn};

use unison_core::error::{CoreError, Result};
use unison_core::store::{ChangeFeed, ChangeSubscription, LockSession, LockStore, ScheduleStore};
use unison_core::types::{NewRule, ScheduleRule, TriggerSpec};

use crate::db::{init_db, store_err};

/// Postgres-backed coordination store.
///
/// Rule reads/edits and `pg_notify` go through a small shared pool; every
/// advisory-lock session and every subscription gets its own dedicated
/// connection, because the locks are scoped to the connection that
/// acquired them and must die with it.
pub struct PgCoordination {
    pool: PgPool,
    url: String,
    channel: String,
}

impl PgCoordination {
    /// Connect and run the idempotent schema init.
    pub async fn connect(url: &str, channel: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(store_err)?;
        init_db(&pool).await?;
        Ok(Self {
            pool,
            url: url.to_string(),
            channel: channel.to_string(),
        })
    }
}

/// One dedicated connection holding advisory locks.
///
/// `close` (or dropping the connection) releases every lock the session
/// held — the server ties advisory locks to the connection lifetime.
pub struct PgLockSession {
    conn: Option<PgConnection>,
}

#[async_trait]
impl LockSession for PgLockSession {
    async fn try_acquire(&mut self, key: i64) -> Result<bool> {
        let conn = self.conn.as_mut().ok_or(CoreError::SessionClosed)?;
        sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_err)
    }

    async fn release(&mut self, key: i64) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(CoreError::SessionClosed)?;
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .map_err(store_err)?;
        if !released {
            debug!(key, "advisory unlock for a key this session did not hold");
        }
        Ok(())
    }

    async fn probe(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => sqlx::query("SELECT 1").execute(&mut *conn).await.is_ok(),
            None => false,
        }
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "error closing lock session connection");
            }
        }
    }
}

#[async_trait]
impl LockStore for PgCoordination {
    async fn session(&self) -> Result<Box<dyn LockSession>> {
        let conn = PgConnection::connect(&self.url).await.map_err(store_err)?;
        Ok(Box::new(PgLockSession { conn: Some(conn) }))
    }
}

#[async_trait]
impl ScheduleStore for PgCoordination {
    async fn fetch_enabled(&self) -> Result<Vec<ScheduleRule>> {
        let rows = sqlx::query(
            "SELECT id, job_name, trigger, enabled, params, scope
             FROM schedule_rules WHERE enabled = TRUE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().filter_map(rule_from_row).collect())
    }

    async fn fetch_all(&self) -> Result<Vec<ScheduleRule>> {
        let rows = sqlx::query(
            "SELECT id, job_name, trigger, enabled, params, scope
             FROM schedule_rules ORDER BY enabled DESC, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(rows.iter().filter_map(rule_from_row).collect())
    }

    async fn insert(&self, rule: NewRule) -> Result<i64> {
        let trigger = serde_json::to_value(&rule.trigger)?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO schedule_rules (job_name, trigger, enabled, params, scope)
             VALUES ($1, $2, TRUE, $3, $4) RETURNING id",
        )
        .bind(&rule.job_name)
        .bind(trigger)
        .bind(&rule.params)
        .bind(&rule.scope)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(id)
    }

    async fn update_trigger(&self, id: i64, trigger: TriggerSpec) -> Result<()> {
        let trigger = serde_json::to_value(&trigger)?;
        let result = sqlx::query(
            "UPDATE schedule_rules SET trigger = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(trigger)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::RuleNotFound { id });
        }
        Ok(())
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedule_rules SET enabled = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::RuleNotFound { id });
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM schedule_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::RuleNotFound { id });
        }
        Ok(())
    }
}

/// Decode one row; rows with malformed trigger JSON are dropped with a
/// warning rather than failing the whole reload.
fn rule_from_row(row: &PgRow) -> Option<ScheduleRule> {
    let id: i64 = row.try_get("id").ok()?;
    let trigger_json: serde_json::Value = row.try_get("trigger").ok()?;
    let trigger: TriggerSpec = match serde_json::from_value(trigger_json) {
        Ok(t) => t,
        Err(e) => {
            warn!(rule_id = id, error = %e, "schedule rule has bad trigger JSON; skipped");
            return None;
        }
    };
    Some(ScheduleRule {
        id,
        job_name: row.try_get("job_name").ok()?,
        trigger,
        enabled: row.try_get("enabled").ok()?,
        params: row.try_get("params").unwrap_or(serde_json::Value::Null),
        scope: row.try_get("scope").ok()?,
    })
}

/// Dedicated `LISTEN` connection.
pub struct PgChangeSubscription {
    listener: PgListener,
}

#[async_trait]
impl ChangeSubscription for PgChangeSubscription {
    async fn recv(&mut self) -> Result<String> {
        let notification = self.listener.recv().await.map_err(store_err)?;
        Ok(notification.payload().to_string())
    }
}

#[async_trait]
impl ChangeFeed for PgCoordination {
    async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>> {
        let mut listener = PgListener::connect(&self.url).await.map_err(store_err)?;
        listener.listen(&self.channel).await.map_err(store_err)?;
        Ok(Box::new(PgChangeSubscription { listener }))
    }

    async fn publish(&self, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
