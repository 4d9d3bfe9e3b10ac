use sqlx::PgPool;

use unison_core::error::{CoreError, Result};

/// Initialise the schedule schema (idempotent).
///
/// The partial index keeps the reload query cheap: every process re-reads
/// all enabled rules on every change notification.
pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schedule_rules (
            id          BIGSERIAL PRIMARY KEY,
            job_name    TEXT        NOT NULL,
            trigger     JSONB       NOT NULL,
            enabled     BOOLEAN     NOT NULL DEFAULT TRUE,
            params      JSONB       NOT NULL DEFAULT '{}'::jsonb,
            scope       TEXT,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_schedule_rules_enabled
         ON schedule_rules (id) WHERE enabled",
    )
    .execute(pool)
    .await
    .map_err(store_err)?;

    Ok(())
}

pub(crate) fn store_err(e: sqlx::Error) -> CoreError {
    CoreError::Store(e.to_string())
}
