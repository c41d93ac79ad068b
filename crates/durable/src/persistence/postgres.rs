//! PostgreSQL implementation of EventLogStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency: the tail check and insert run in one
//!   transaction holding a row lock on the run
//! - A partial unique index guaranteeing one open run per execution
//! - Event rows keyed by `(run_id, sequence)` for ordered reads

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowEvent};

/// Unique violation, raised by the one-open-run-per-execution index
const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL implementation of EventLogStore
///
/// # Example
///
/// ```ignore
/// use keel_durable::PostgresEventLogStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresEventLogStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresEventLogStore {
    pool: PgPool,
}

impl PostgresEventLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(db_error("run migrations"))
    }
}

#[async_trait]
impl EventLogStore for PostgresEventLogStore {
    #[instrument(skip(self, new), fields(execution_id = %new.execution_id, run_id = %new.run_id))]
    async fn create_execution(&self, new: NewExecution) -> Result<ExecutionRecord, StoreError> {
        let status = validate_batch(0, &new.events)?;
        let status = status.unwrap_or(ExecutionStatus::Running);
        let closed_at = status.is_closed().then_some(new.created_at);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("begin or commit"))?;

        let open = sqlx::query(
            r#"
            SELECT run_id FROM keel_runs
            WHERE execution_id = $1 AND status = 'running'
            FOR UPDATE
            "#,
        )
        .bind(&new.execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("find open run"))?;

        if let Some(row) = open {
            return Err(StoreError::AlreadyStarted {
                execution_id: new.execution_id,
                run_id: row.get("run_id"),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO keel_runs (
                run_id, execution_id, workflow_type, task_queue, status,
                last_sequence, created_at, closed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(new.run_id)
        .bind(&new.execution_id)
        .bind(&new.workflow_type)
        .bind(&new.task_queue)
        .bind(status.as_str())
        .bind(new.events.len() as i64)
        .bind(new.created_at)
        .bind(closed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e.as_database_error().and_then(|d| d.code()) {
            Some(code) if code == UNIQUE_VIOLATION => StoreError::AlreadyStarted {
                execution_id: new.execution_id.clone(),
                run_id: new.run_id,
            },
            _ => db_error("create run")(e.to_string()),
        })?;

        insert_events(&mut tx, new.run_id, &new.events).await?;

        tx.commit()
            .await
            .map_err(db_error("begin or commit"))?;

        debug!("created run");
        Ok(ExecutionRecord {
            execution_id: new.execution_id,
            run_id: new.run_id,
            workflow_type: new.workflow_type,
            task_queue: new.task_queue,
            status,
            last_sequence: new.events.len() as u64,
            created_at: new.created_at,
            closed_at,
        })
    }

    #[instrument(skip(self, events))]
    async fn append(
        &self,
        run_id: Uuid,
        expected_tail: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("begin or commit"))?;

        // Row lock serializes appenders of the same run
        let row = sqlx::query(
            r#"
            SELECT status, last_sequence FROM keel_runs
            WHERE run_id = $1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock run"))?
        .ok_or(StoreError::RunNotFound(run_id))?;

        let status: ExecutionStatus = row.get::<String, _>("status").parse()?;
        let actual = row.get::<i64, _>("last_sequence") as u64;

        if status.is_closed() {
            return Err(StoreError::ExecutionClosed(run_id));
        }
        if actual != expected_tail {
            return Err(StoreError::Conflict {
                expected: expected_tail,
                actual,
            });
        }

        let closed = validate_batch(expected_tail, &events)?;
        insert_events(&mut tx, run_id, &events).await?;

        let new_tail = expected_tail + events.len() as u64;
        let new_status = closed.unwrap_or(ExecutionStatus::Running);
        let closed_at = closed.and(events.last().map(|e| e.recorded_at));

        sqlx::query(
            r#"
            UPDATE keel_runs
            SET last_sequence = $2,
                status = $3,
                closed_at = COALESCE($4, closed_at)
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(new_tail as i64)
        .bind(new_status.as_str())
        .bind(closed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error("advance run tail"))?;

        tx.commit()
            .await
            .map_err(db_error("begin or commit"))?;

        debug!(%run_id, new_tail, "appended events");
        Ok(new_tail)
    }

    #[instrument(skip(self))]
    async fn read(&self, run_id: Uuid, from_seq: u64) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, recorded_at, event_data
            FROM keel_events
            WHERE run_id = $1 AND sequence >= $2
            ORDER BY sequence
            "#,
        )
        .bind(run_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("read events"))?;

        if rows.is_empty() {
            // distinguish an unknown run from an empty range
            self.get_run(run_id).await?;
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent = serde_json::from_value(data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            events.push(HistoryEvent {
                sequence: row.get::<i64, _>("sequence") as u64,
                recorded_at: row.get("recorded_at"),
                event,
            });
        }

        Ok(events)
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, execution_id, workflow_type, task_queue, status,
                   last_sequence, created_at, closed_at
            FROM keel_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get run"))?
        .ok_or(StoreError::RunNotFound(run_id))?;

        record_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn current_run(&self, execution_id: &str) -> Result<ExecutionRecord, StoreError> {
        // run ids are UUID v7, so the newest run sorts last
        let row = sqlx::query(
            r#"
            SELECT run_id, execution_id, workflow_type, task_queue, status,
                   last_sequence, created_at, closed_at
            FROM keel_runs
            WHERE execution_id = $1
            ORDER BY run_id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get current run"))?
        .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;

        record_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_open_runs(&self) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, execution_id, workflow_type, task_queue, status,
                   last_sequence, created_at, closed_at
            FROM keel_runs
            WHERE status = 'running'
            ORDER BY run_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list open runs"))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        // keel_events rows go with their run via ON DELETE CASCADE
        let result = sqlx::query(
            r#"
            DELETE FROM keel_runs
            WHERE closed_at IS NOT NULL AND closed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_error("purge runs"))?;

        let purged = result.rows_affected();
        if purged > 0 {
            debug!(purged, "purged closed runs");
        }
        Ok(purged)
    }
}

async fn insert_events(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    run_id: Uuid,
    events: &[HistoryEvent],
) -> Result<(), StoreError> {
    for event in events {
        let event_data = serde_json::to_value(&event.event)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO keel_events (run_id, sequence, event_type, event_data, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(run_id)
        .bind(event.sequence as i64)
        .bind(event.event.kind())
        .bind(&event_data)
        .bind(event.recorded_at)
        .execute(&mut **tx)
        .await
        .map_err(db_error("insert event"))?;
    }
    Ok(())
}

fn record_from_row(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
    Ok(ExecutionRecord {
        execution_id: row.get("execution_id"),
        run_id: row.get("run_id"),
        workflow_type: row.get("workflow_type"),
        task_queue: row.get("task_queue"),
        status: row.get::<String, _>("status").parse()?,
        last_sequence: row.get::<i64, _>("last_sequence") as u64,
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    })
}

/// Log a database failure once, at the store boundary
fn db_error<E: std::fmt::Display>(op: &'static str) -> impl Fn(E) -> StoreError {
    move |e| {
        error!(op, error = %e, "database operation failed");
        StoreError::Database(e.to_string())
    }
}
