//! Run store port.
//!
//! The store is the only shared mutable resource of the engine. Every run
//! and every node attempt is persisted through this port; the engine writes
//! ahead of progress so an interrupted run can always be resumed.
//!
//! Keys:
//! - runs: `(workflow_name, run_id)` — `run_id` autoincrements per workflow
//! - executions: `(workflow_name, run_id, node_id, attempt)` — attempts form
//!   a dense `1..N` sequence; the max-attempt row is authoritative

use crate::status::{Decision, NodeStatus, RunStatus, TriggerKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// A persisted run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Workflow (runbook) name.
    pub workflow_name: String,
    /// Run number within the workflow, starting at 1.
    pub run_id: i64,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Current status.
    pub status: RunStatus,
    /// What started the run.
    pub trigger: TriggerKind,
    /// Count of nodes that finished OK.
    pub nodes_ok: i64,
    /// Count of nodes that finished NOK.
    pub nodes_nok: i64,
    /// Count of nodes that were skipped.
    pub nodes_skipped: i64,
    /// JSON snapshot of the resolved variables.
    pub variables_json: String,
    /// SHA-256 digest of the runbook file at run time.
    pub runbook_digest: String,
}

/// Final node counters for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunCounters {
    pub ok: i64,
    pub nok: i64,
    pub skipped: i64,
}

/// Primary key of a node execution row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionKey {
    pub workflow_name: String,
    pub run_id: i64,
    pub node_id: String,
    pub attempt: i64,
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.workflow_name, self.run_id, self.node_id, self.attempt
        )
    }
}

/// A persisted node attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub workflow_name: String,
    pub run_id: i64,
    pub node_id: String,
    /// Attempt number within `(run, node)`, starting at 1.
    pub attempt: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: NodeStatus,
    pub operator_decision: Decision,
    pub result_text: Option<String>,
    pub exit_code: Option<i64>,
    pub exception: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i64>,
}

impl AttemptRecord {
    /// Returns the primary key of this row.
    #[must_use]
    pub fn key(&self) -> ExecutionKey {
        ExecutionKey {
            workflow_name: self.workflow_name.clone(),
            run_id: self.run_id,
            node_id: self.node_id.clone(),
            attempt: self.attempt,
        }
    }
}

/// The terminal update applied to an open attempt row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptClose {
    pub status: NodeStatus,
    pub operator_decision: Decision,
    pub result_text: Option<String>,
    pub exit_code: Option<i64>,
    pub exception: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<i64>,
}

impl AttemptClose {
    /// A terminal update with the given status and no other detail.
    #[must_use]
    pub fn with_status(status: NodeStatus) -> Self {
        Self {
            status,
            operator_decision: Decision::None,
            result_text: None,
            exit_code: None,
            exception: None,
            stdout: None,
            stderr: None,
            duration_ms: None,
        }
    }
}

impl Default for AttemptClose {
    fn default() -> Self {
        Self::with_status(NodeStatus::Ok)
    }
}

/// Errors from store operations.
///
/// Any store error during a live run is fatal to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend failure (I/O, SQL).
    Backend { message: String },
    /// A referenced run does not exist.
    RunNotFound { workflow_name: String, run_id: i64 },
    /// A referenced execution row does not exist.
    ExecutionNotFound { key: String },
    /// A persisted value could not be interpreted.
    Corrupt { message: String },
}

impl StoreError {
    /// Stable machine code for the CLI surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend { .. } => "store_backend",
            Self::RunNotFound { .. } => "run_not_found",
            Self::ExecutionNotFound { .. } => "execution_not_found",
            Self::Corrupt { .. } => "store_corrupt",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message } => write!(f, "store backend error: {message}"),
            Self::RunNotFound {
                workflow_name,
                run_id,
            } => write!(f, "run not found: {workflow_name}/{run_id}"),
            Self::ExecutionNotFound { key } => write!(f, "execution not found: {key}"),
            Self::Corrupt { message } => write!(f, "corrupt store data: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable, transactional persistence of runs and node attempts.
///
/// Implementations serialize writers internally; reads are
/// snapshot-consistent within one engine tick.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a run in RUNNING state and returns its run id.
    ///
    /// The run id is the next integer for the workflow (monotonic).
    async fn create_run(
        &self,
        workflow_name: &str,
        trigger: TriggerKind,
        variables_json: &str,
        runbook_digest: &str,
    ) -> Result<i64, StoreError>;

    /// Returns the most recent run for a workflow, if any.
    async fn latest_run_for(&self, workflow_name: &str) -> Result<Option<RunRecord>, StoreError>;

    /// Returns a specific run, if it exists.
    async fn get_run(
        &self,
        workflow_name: &str,
        run_id: i64,
    ) -> Result<Option<RunRecord>, StoreError>;

    /// Closes (or reopens) a run with status, counters, and end time.
    async fn update_run_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Overrides a run's status without touching counters.
    ///
    /// Used to rehabilitate orphaned RUNNING rows before resume.
    async fn set_run_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
    ) -> Result<(), StoreError>;

    /// Opens a new attempt row (status PENDING) and returns its number.
    ///
    /// The attempt number is one past the max existing attempt for the node.
    async fn begin_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &str,
    ) -> Result<i64, StoreError>;

    /// Applies the terminal update to an open attempt row.
    async fn finish_attempt(
        &self,
        key: &ExecutionKey,
        close: AttemptClose,
    ) -> Result<(), StoreError>;

    /// Returns the max-attempt row for a node, if any.
    async fn latest_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &str,
    ) -> Result<Option<AttemptRecord>, StoreError>;

    /// Returns all execution rows of a run, ordered by start time.
    async fn executions_for(
        &self,
        workflow_name: &str,
        run_id: i64,
    ) -> Result<Vec<AttemptRecord>, StoreError>;
}

/// In-memory store.
///
/// Backs engine tests and ad-hoc dry runs; implements the same contract as
/// the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    runs: HashMap<String, Vec<RunRecord>>,
    executions: Vec<AttemptRecord>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(
        &self,
        workflow_name: &str,
        trigger: TriggerKind,
        variables_json: &str,
        runbook_digest: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let runs = inner.runs.entry(workflow_name.to_string()).or_default();
        let run_id = runs.iter().map(|r| r.run_id).max().unwrap_or(0) + 1;
        runs.push(RunRecord {
            workflow_name: workflow_name.to_string(),
            run_id,
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            trigger,
            nodes_ok: 0,
            nodes_nok: 0,
            nodes_skipped: 0,
            variables_json: variables_json.to_string(),
            runbook_digest: runbook_digest.to_string(),
        });
        Ok(run_id)
    }

    async fn latest_run_for(&self, workflow_name: &str) -> Result<Option<RunRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .runs
            .get(workflow_name)
            .and_then(|runs| runs.iter().max_by_key(|r| r.run_id))
            .cloned())
    }

    async fn get_run(
        &self,
        workflow_name: &str,
        run_id: i64,
    ) -> Result<Option<RunRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .runs
            .get(workflow_name)
            .and_then(|runs| runs.iter().find(|r| r.run_id == run_id))
            .cloned())
    }

    async fn update_run_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
        counters: RunCounters,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let run = inner
            .runs
            .get_mut(workflow_name)
            .and_then(|runs| runs.iter_mut().find(|r| r.run_id == run_id))
            .ok_or_else(|| StoreError::RunNotFound {
                workflow_name: workflow_name.to_string(),
                run_id,
            })?;
        run.status = status;
        run.nodes_ok = counters.ok;
        run.nodes_nok = counters.nok;
        run.nodes_skipped = counters.skipped;
        run.end_time = end_time;
        Ok(())
    }

    async fn set_run_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let run = inner
            .runs
            .get_mut(workflow_name)
            .and_then(|runs| runs.iter_mut().find(|r| r.run_id == run_id))
            .ok_or_else(|| StoreError::RunNotFound {
                workflow_name: workflow_name.to_string(),
                run_id,
            })?;
        run.status = status;
        if status.is_terminal() {
            if run.end_time.is_none() {
                run.end_time = Some(Utc::now());
            }
        } else {
            run.end_time = None;
        }
        Ok(())
    }

    async fn begin_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let attempt = inner
            .executions
            .iter()
            .filter(|e| {
                e.workflow_name == workflow_name && e.run_id == run_id && e.node_id == node_id
            })
            .map(|e| e.attempt)
            .max()
            .unwrap_or(0)
            + 1;
        inner.executions.push(AttemptRecord {
            workflow_name: workflow_name.to_string(),
            run_id,
            node_id: node_id.to_string(),
            attempt,
            start_time: Utc::now(),
            end_time: None,
            status: NodeStatus::Pending,
            operator_decision: Decision::None,
            result_text: None,
            exit_code: None,
            exception: None,
            stdout: None,
            stderr: None,
            duration_ms: None,
        });
        Ok(attempt)
    }

    async fn finish_attempt(
        &self,
        key: &ExecutionKey,
        close: AttemptClose,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let row = inner
            .executions
            .iter_mut()
            .find(|e| {
                e.workflow_name == key.workflow_name
                    && e.run_id == key.run_id
                    && e.node_id == key.node_id
                    && e.attempt == key.attempt
            })
            .ok_or_else(|| StoreError::ExecutionNotFound {
                key: key.to_string(),
            })?;
        row.status = close.status;
        row.operator_decision = close.operator_decision;
        row.result_text = close.result_text;
        row.exit_code = close.exit_code;
        row.exception = close.exception;
        row.stdout = close.stdout;
        row.stderr = close.stderr;
        row.duration_ms = close.duration_ms;
        row.end_time = Some(Utc::now());
        Ok(())
    }

    async fn latest_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &str,
    ) -> Result<Option<AttemptRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .executions
            .iter()
            .filter(|e| {
                e.workflow_name == workflow_name && e.run_id == run_id && e.node_id == node_id
            })
            .max_by_key(|e| e.attempt)
            .cloned())
    }

    async fn executions_for(
        &self,
        workflow_name: &str,
        run_id: i64,
    ) -> Result<Vec<AttemptRecord>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut rows: Vec<AttemptRecord> = inner
            .executions
            .iter()
            .filter(|e| e.workflow_name == workflow_name && e.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(rows)
    }
}
