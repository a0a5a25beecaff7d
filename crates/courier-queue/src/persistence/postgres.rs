//! PostgreSQL implementation of WorkStore
//!
//! Production persistence using PostgreSQL with:
//! - Serializable batch claiming with `FOR UPDATE SKIP LOCKED`
//! - Multi-id membership updates (`id = ANY($1)`)
//! - Fatal transitions and their diagnostics committed together
//! - Outcome writes guarded by the claiming attempt

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};

use super::store::*;

/// How many times a claim transaction is re-run after a serialization failure
const CLAIM_SERIALIZATION_RETRIES: u32 = 3;

/// SQLSTATE for `serialization_failure`
const SERIALIZATION_FAILURE: &str = "40001";

/// Embedded schema migrations for the `tasks` and `errors` tables
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// PostgreSQL implementation of WorkStore
///
/// # Example
///
/// ```ignore
/// use courier_queue::PostgresWorkStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/courier").await?;
/// let store = PostgresWorkStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkStore {
    pool: PgPool,
}

impl PostgresWorkStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn try_claim(&self, limit: i64) -> Result<Vec<TaskRecord>, sqlx::Error> {
        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM tasks
            WHERE status IN ('NEW', 'FAILURE')
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'RUNNING',
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING id, payload, status, attempts, created_at, updated_at
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push(task_from_row(row).map_err(|e| sqlx::Error::Decode(Box::new(e)))?);
        }
        claimed.sort_by_key(|t| t.id);
        Ok(claimed)
    }

    /// Explain a guarded write that matched no row
    async fn claim_miss(&self, id: TaskId, attempt: u32) -> StoreError {
        let exists: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tasks WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await;

        match exists {
            Ok(true) => {
                warn!(task_id = id, attempt, "claim lost before outcome was written");
                StoreError::ClaimLost { id, attempt }
            }
            Ok(false) => StoreError::TaskNotFound(id),
            Err(e) => StoreError::Database(e.to_string()),
        }
    }
}

#[async_trait]
impl WorkStore for PostgresWorkStore {
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    async fn create(&self, payload: &str) -> Result<TaskId, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO tasks (payload, status)
            VALUES ($1, 'NEW')
            RETURNING id
            "#,
        )
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(task_id = id, "created task");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_claim(limit).await {
                Ok(claimed) => {
                    if !claimed.is_empty() {
                        debug!(count = claimed.len(), "claimed tasks");
                    }
                    return Ok(claimed);
                }
                Err(e) if is_serialization_failure(&e) => {
                    if attempt >= CLAIM_SERIALIZATION_RETRIES {
                        warn!(attempt, "claim transaction still conflicting, giving up");
                        return Err(StoreError::Conflict { attempts: attempt });
                    }
                    debug!(attempt, "claim transaction conflicted, retrying");
                }
                Err(e) => {
                    error!("Failed to claim tasks: {}", e);
                    return Err(StoreError::Database(e.to_string()));
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<TaskId>, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_default();

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET status = 'FAILURE',
                updated_at = NOW()
            WHERE status = 'RUNNING'
              AND updated_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if !ids.is_empty() {
            debug!(count = ids.len(), "reclaimed stale tasks");
        }
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }

        debug!(task_id = id, %status, "updated task status");
        Ok(())
    }

    #[instrument(skip(self, detail))]
    async fn record_error(&self, id: TaskId, detail: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO errors (task_id, detail)
            VALUES ($1, $2)
            "#,
        )
        .bind(id)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                StoreError::TaskNotFound(id)
            }
            _ => StoreError::Database(e.to_string()),
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_failure(&self, id: TaskId, attempt: u32) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILURE',
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING' AND attempts = $2
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_miss(id, attempt).await);
        }

        debug!(task_id = id, "task released for retry");
        Ok(())
    }

    #[instrument(skip(self, detail))]
    async fn mark_fatal(&self, id: TaskId, attempt: u32, detail: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FATAL',
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING' AND attempts = $2
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            return Err(self.claim_miss(id, attempt).await);
        }

        sqlx::query(
            r#"
            INSERT INTO errors (task_id, detail)
            VALUES ($1, $2)
            "#,
        )
        .bind(id)
        .bind(detail)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(task_id = id, "task marked fatal");
        Ok(())
    }

    #[instrument(skip(self, payload))]
    async fn mark_success(
        &self,
        id: TaskId,
        attempt: u32,
        payload: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'SUCCESS',
                payload = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING' AND attempts = $2
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.claim_miss(id, attempt).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, payload, status, attempts, created_at, updated_at
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn errors(&self, id: TaskId) -> Result<Vec<ErrorRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, detail, created_at
            FROM errors
            WHERE task_id = $1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| ErrorRecord {
                id: row.get("id"),
                task_id: row.get("task_id"),
                detail: row.get("detail"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

fn task_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.get("status");
    Ok(TaskRecord {
        id: row.get("id"),
        payload: row.get("payload"),
        status: status.parse()?,
        attempts: row.get::<i32, _>("attempts").max(0) as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(SERIALIZATION_FAILURE),
        _ => false,
    }
}
