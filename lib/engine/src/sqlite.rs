//! SQLite-backed run store.
//!
//! The durable implementation of the [`RunStore`] port. Every mutation runs
//! in a single transaction; a writer lock serializes mutating callers while
//! concurrent readers (info/show surfaces) go straight to the pool.

use crate::status::{Decision, NodeStatus, RunStatus, TriggerKind};
use crate::store::{
    AttemptClose, AttemptRecord, ExecutionKey, RunCounters, RunRecord, RunStore, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    workflow_name  TEXT NOT NULL,
    run_id         INTEGER NOT NULL,
    start_time     TEXT NOT NULL,
    end_time       TEXT,
    status         TEXT NOT NULL,
    "trigger"      TEXT NOT NULL,
    nodes_ok       INTEGER NOT NULL DEFAULT 0,
    nodes_nok      INTEGER NOT NULL DEFAULT 0,
    nodes_skipped  INTEGER NOT NULL DEFAULT 0,
    variables_json TEXT NOT NULL,
    runbook_digest TEXT NOT NULL,
    PRIMARY KEY (workflow_name, run_id)
);

CREATE TABLE IF NOT EXISTS executions (
    workflow_name     TEXT NOT NULL,
    run_id            INTEGER NOT NULL,
    node_id           TEXT NOT NULL,
    attempt           INTEGER NOT NULL,
    start_time        TEXT NOT NULL,
    end_time          TEXT,
    status            TEXT NOT NULL,
    operator_decision TEXT NOT NULL,
    result_text       TEXT,
    exit_code         INTEGER,
    exception         TEXT,
    stdout            TEXT,
    stderr            TEXT,
    duration_ms       INTEGER,
    PRIMARY KEY (workflow_name, run_id, node_id, attempt)
);
"#;

/// SQLite implementation of the run store.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: tokio::sync::Mutex<()>,
}

impl SqliteStore {
    /// Opens (creating if needed) a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` when the database cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(backend)?;
        Self::with_pool(pool).await
    }

    /// Opens an in-memory store (single connection).
    ///
    /// # Errors
    ///
    /// Returns a `StoreError` when the schema cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(backend)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(backend)?;
        }
        Ok(Self {
            pool,
            writer: tokio::sync::Mutex::new(()),
        })
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend {
        message: e.to_string(),
    }
}

/// Row type for run queries.
#[derive(FromRow)]
struct RunRow {
    workflow_name: String,
    run_id: i64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    trigger: String,
    nodes_ok: i64,
    nodes_nok: i64,
    nodes_skipped: i64,
    variables_json: String,
    runbook_digest: String,
}

impl RunRow {
    fn try_into_record(self) -> Result<RunRecord, StoreError> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            message: format!("unknown run status '{}'", self.status),
        })?;
        let trigger = TriggerKind::parse(&self.trigger).ok_or_else(|| StoreError::Corrupt {
            message: format!("unknown trigger '{}'", self.trigger),
        })?;
        Ok(RunRecord {
            workflow_name: self.workflow_name,
            run_id: self.run_id,
            start_time: self.start_time,
            end_time: self.end_time,
            status,
            trigger,
            nodes_ok: self.nodes_ok,
            nodes_nok: self.nodes_nok,
            nodes_skipped: self.nodes_skipped,
            variables_json: self.variables_json,
            runbook_digest: self.runbook_digest,
        })
    }
}

const RUN_COLUMNS: &str = r#"workflow_name, run_id, start_time, end_time, status, "trigger",
       nodes_ok, nodes_nok, nodes_skipped, variables_json, runbook_digest"#;

/// Row type for execution queries.
#[derive(FromRow)]
struct ExecutionRow {
    workflow_name: String,
    run_id: i64,
    node_id: String,
    attempt: i64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    operator_decision: String,
    result_text: Option<String>,
    exit_code: Option<i64>,
    exception: Option<String>,
    stdout: Option<String>,
    stderr: Option<String>,
    duration_ms: Option<i64>,
}

impl ExecutionRow {
    fn try_into_record(self) -> Result<AttemptRecord, StoreError> {
        let status = NodeStatus::parse(&self.status).ok_or_else(|| StoreError::Corrupt {
            message: format!("unknown node status '{}'", self.status),
        })?;
        let operator_decision =
            Decision::parse(&self.operator_decision).ok_or_else(|| StoreError::Corrupt {
                message: format!("unknown decision '{}'", self.operator_decision),
            })?;
        Ok(AttemptRecord {
            workflow_name: self.workflow_name,
            run_id: self.run_id,
            node_id: self.node_id,
            attempt: self.attempt,
            start_time: self.start_time,
            end_time: self.end_time,
            status,
            operator_decision,
            result_text: self.result_text,
            exit_code: self.exit_code,
            exception: self.exception,
            stdout: self.stdout,
            stderr: self.stderr,
            duration_ms: self.duration_ms,
        })
    }
}

const EXECUTION_COLUMNS: &str = "workflow_name, run_id, node_id, attempt, start_time, end_time, \
     status, operator_decision, result_text, exit_code, exception, stdout, stderr, duration_ms";

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(
        &self,
        workflow_name: &str,
        trigger: TriggerKind,
        variables_json: &str,
        runbook_digest: &str,
    ) -> Result<i64, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let max: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(run_id), 0) FROM runs WHERE workflow_name = ?")
                .bind(workflow_name)
                .fetch_one(&mut *tx)
                .await
                .map_err(backend)?;
        let run_id = max + 1;

        sqlx::query(
            r#"
            INSERT INTO runs
                (workflow_name, run_id, start_time, end_time, status, "trigger",
                 nodes_ok, nodes_nok, nodes_skipped, variables_json, runbook_digest)
            VALUES (?, ?, ?, NULL, ?, ?, 0, 0, 0, ?, ?)
            "#,
        )
        .bind(workflow_name)
        .bind(run_id)
        .bind(Utc::now())
        .bind(RunStatus::Running.as_str())
        .bind(trigger.as_str())
        .bind(variables_json)
        .bind(runbook_digest)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(run_id)
    }

    async fn latest_run_for(&self, workflow_name: &str) -> Result<Option<RunRecord>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_name = ? \
             ORDER BY run_id DESC LIMIT 1"
        ))
        .bind(workflow_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(RunRow::try_into_record).transpose()
    }

    async fn get_run(
        &self,
        workflow_name: &str,
        run_id: i64,
    ) -> Result<Option<RunRecord>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_name = ? AND run_id = ?"
        ))
        .bind(workflow_name)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(RunRow::try_into_record).transpose()
    }

    async fn update_run_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE runs SET status = ?, nodes_ok = ?, nodes_nok = ?, nodes_skipped = ?, \
             end_time = ? WHERE workflow_name = ? AND run_id = ?",
        )
        .bind(status.as_str())
        .bind(counters.ok)
        .bind(counters.nok)
        .bind(counters.skipped)
        .bind(end_time)
        .bind(workflow_name)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound {
                workflow_name: workflow_name.to_string(),
                run_id,
            });
        }
        Ok(())
    }

    async fn set_run_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        // Reopening a run clears its end time; closing one stamps it once.
        let result = if status.is_terminal() {
            sqlx::query(
                "UPDATE runs SET status = ?, \
                 end_time = COALESCE(end_time, ?) WHERE workflow_name = ? AND run_id = ?",
            )
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(workflow_name)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?
        } else {
            sqlx::query(
                "UPDATE runs SET status = ?, end_time = NULL \
                 WHERE workflow_name = ? AND run_id = ?",
            )
            .bind(status.as_str())
            .bind(workflow_name)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound {
                workflow_name: workflow_name.to_string(),
                run_id,
            });
        }
        Ok(())
    }

    async fn begin_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &str,
    ) -> Result<i64, StoreError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt), 0) FROM executions \
             WHERE workflow_name = ? AND run_id = ? AND node_id = ?",
        )
        .bind(workflow_name)
        .bind(run_id)
        .bind(node_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let attempt = max + 1;

        sqlx::query(
            "INSERT INTO executions \
                 (workflow_name, run_id, node_id, attempt, start_time, status, operator_decision) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow_name)
        .bind(run_id)
        .bind(node_id)
        .bind(attempt)
        .bind(Utc::now())
        .bind(NodeStatus::Pending.as_str())
        .bind(Decision::None.as_str())
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(attempt)
    }

    async fn finish_attempt(
        &self,
        key: &ExecutionKey,
        close: AttemptClose,
    ) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query(
            "UPDATE executions SET status = ?, operator_decision = ?, result_text = ?, \
             exit_code = ?, exception = ?, stdout = ?, stderr = ?, duration_ms = ?, end_time = ? \
             WHERE workflow_name = ? AND run_id = ? AND node_id = ? AND attempt = ?",
        )
        .bind(close.status.as_str())
        .bind(close.operator_decision.as_str())
        .bind(close.result_text)
        .bind(close.exit_code)
        .bind(close.exception)
        .bind(close.stdout)
        .bind(close.stderr)
        .bind(close.duration_ms)
        .bind(Utc::now())
        .bind(&key.workflow_name)
        .bind(key.run_id)
        .bind(&key.node_id)
        .bind(key.attempt)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn latest_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &str,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE workflow_name = ? AND run_id = ? AND node_id = ? \
             ORDER BY attempt DESC LIMIT 1"
        ))
        .bind(workflow_name)
        .bind(run_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(ExecutionRow::try_into_record).transpose()
    }

    async fn executions_for(
        &self,
        workflow_name: &str,
        run_id: i64,
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE workflow_name = ? AND run_id = ? \
             ORDER BY start_time ASC, attempt ASC"
        ))
        .bind(workflow_name)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(ExecutionRow::try_into_record)
            .collect()
    }
}
