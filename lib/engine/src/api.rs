//! The engine API surface consumed by front-ends.
//!
//! `run`, `resume`, `validate`, and `set_status` compose the pipeline:
//! read the runbook file, resolve variables, plan, then drive the engine.
//! Every failure maps onto a stable machine code and a process exit code:
//!
//! - 0: run OK
//! - 1: run NOK
//! - 2: run ABORTED
//! - 3: parse/plan/state errors
//! - 4: variable errors

use crate::command::{CommandRunner, ProcessRunner};
use crate::engine::{Engine, EngineConfig, EngineError, RunReport, RunnerSet};
use crate::function::{FunctionRunner, PluginRegistry};
use crate::interact::Interactor;
use crate::manual::ManualRunner;
use crate::plan::{self, Plan, PlanError};
use crate::status::RunStatus;
use crate::store::{AttemptRecord, RunRecord, RunStore};
use crate::vars::{
    Prompter, ResolvedVariables, VariableError, VariableResolver, VariableSources, scrape_env,
};
use opsrun_runbook::{ParseError, Runbook, load_runbook, load_variables_file};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors about the state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No run exists for the workflow.
    NoRun { workflow_name: String },
    /// The run is not in a resumable state (only ABORTED resumes).
    NotResumable {
        workflow_name: String,
        run_id: i64,
        status: RunStatus,
    },
}

impl StateError {
    /// Stable machine code for the CLI surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoRun { .. } => "no_run",
            Self::NotResumable { status, .. } => match status {
                RunStatus::Ok => "not_resumable_ok",
                RunStatus::Nok => "not_resumable_nok",
                RunStatus::Running => "not_resumable_running",
                RunStatus::Aborted => "not_resumable",
            },
        }
    }

    /// A short operator-facing suggestion.
    #[must_use]
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::NoRun { .. } => "start the workflow with 'run' first",
            Self::NotResumable { status, .. } => match status {
                RunStatus::Running => {
                    "if no executor is alive this run is orphaned; repair it with set-status"
                }
                _ => "only aborted runs can be resumed",
            },
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRun { workflow_name } => {
                write!(f, "no runs recorded for workflow '{workflow_name}'")
            }
            Self::NotResumable {
                workflow_name,
                run_id,
                status,
            } => write!(
                f,
                "run {workflow_name}/{run_id} is {status} and cannot be resumed"
            ),
        }
    }
}

impl std::error::Error for StateError {}

/// Any failure surfaced by the API.
#[derive(Debug, Clone, PartialEq)]
pub enum OpsError {
    Parse(ParseError),
    Plan(PlanError),
    Variable(VariableError),
    State(StateError),
    Engine(EngineError),
}

impl OpsError {
    /// Stable machine code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(e) => e.code(),
            Self::Plan(e) => e.code(),
            Self::Variable(e) => e.code(),
            Self::State(e) => e.code(),
            Self::Engine(e) => e.code(),
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_) | Self::Plan(_) | Self::State(_) => 3,
            Self::Variable(_) => 4,
            Self::Engine(_) => 1,
        }
    }
}

impl fmt::Display for OpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => e.fmt(f),
            Self::Plan(e) => e.fmt(f),
            Self::Variable(e) => e.fmt(f),
            Self::State(e) => e.fmt(f),
            Self::Engine(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for OpsError {}

impl From<ParseError> for OpsError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<PlanError> for OpsError {
    fn from(e: PlanError) -> Self {
        Self::Plan(e)
    }
}

impl From<VariableError> for OpsError {
    fn from(e: VariableError) -> Self {
        Self::Variable(e)
    }
}

impl From<StateError> for OpsError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<EngineError> for OpsError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

/// Per-invocation inputs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit `KEY=VALUE` overrides.
    pub overrides: BTreeMap<String, String>,
    /// Optional variables file.
    pub var_file: Option<PathBuf>,
    /// Environment prefix to scrape variables from; `None` disables.
    pub env_prefix: Option<String>,
}

/// Process exit code for a whole invocation.
#[must_use]
pub fn exit_code(result: &Result<RunReport, OpsError>) -> i32 {
    match result {
        Ok(report) => report.exit_code(),
        Err(e) => e.exit_code(),
    }
}

/// Parses and plans a runbook file without executing it.
///
/// # Errors
///
/// Returns an `OpsError` describing the first parse or plan failure.
pub fn validate(file: &Path) -> Result<(Runbook, Plan), OpsError> {
    let runbook = load_runbook(file)?;
    let plan = plan::plan(&runbook)?;
    Ok((runbook, plan))
}

/// The assembled executor: store, ports, and configuration.
pub struct Executor<S: RunStore> {
    store: Arc<S>,
    interactor: Arc<dyn Interactor>,
    prompter: Arc<dyn Prompter>,
    registry: Arc<dyn PluginRegistry>,
    process: Arc<dyn ProcessRunner>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl<S: RunStore> Executor<S> {
    /// Assembles an executor from its ports.
    pub fn new(
        store: Arc<S>,
        interactor: Arc<dyn Interactor>,
        prompter: Arc<dyn Prompter>,
        registry: Arc<dyn PluginRegistry>,
        process: Arc<dyn ProcessRunner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            interactor,
            prompter,
            registry,
            process,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// The cancellation token; wire the SIGINT handler to this.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs a runbook file from scratch.
    ///
    /// # Errors
    ///
    /// Returns an `OpsError` on parse, plan, variable, or engine failures.
    pub async fn run(&self, file: &Path, options: &RunOptions) -> Result<RunReport, OpsError> {
        let runbook = load_runbook(file)?;
        let plan = plan::plan(&runbook)?;
        let sources = gather_sources(options)?;
        let resolver = VariableResolver::new(&runbook.variables, self.config.interactive);
        let vars = resolver
            .resolve(&sources, self.prompter.as_ref())
            .await?;

        self.surface_orphan(&runbook.name).await?;

        let report = self.engine().execute(&runbook, &plan, &vars).await?;
        Ok(report)
    }

    /// Resumes an aborted run.
    ///
    /// Without an explicit `run_id` the latest run is used. Variables are
    /// rebuilt from the run's persisted snapshot with the caller-supplied
    /// layers overlaid.
    ///
    /// # Errors
    ///
    /// Returns an `OpsError` when the run does not exist or is not
    /// ABORTED, or on parse, plan, variable, or engine failures.
    pub async fn resume(
        &self,
        file: &Path,
        run_id: Option<i64>,
        options: &RunOptions,
    ) -> Result<RunReport, OpsError> {
        let runbook = load_runbook(file)?;
        let plan = plan::plan(&runbook)?;

        self.surface_orphan(&runbook.name).await?;

        let run = match run_id {
            Some(id) => self
                .store
                .get_run(&runbook.name, id)
                .await
                .map_err(EngineError::from)?,
            None => self
                .store
                .latest_run_for(&runbook.name)
                .await
                .map_err(EngineError::from)?,
        };
        let Some(run) = run else {
            return Err(StateError::NoRun {
                workflow_name: runbook.name.clone(),
            }
            .into());
        };
        if run.status != RunStatus::Aborted {
            return Err(StateError::NotResumable {
                workflow_name: runbook.name.clone(),
                run_id: run.run_id,
                status: run.status,
            }
            .into());
        }

        if run.runbook_digest != runbook.digest {
            warn!(
                workflow = %runbook.name,
                run_id = run.run_id,
                "runbook changed since the original run; resuming anyway"
            );
        }

        let snapshot: ResolvedVariables =
            serde_json::from_str(&run.variables_json).map_err(|e| {
                OpsError::Engine(EngineError::Snapshot {
                    message: e.to_string(),
                })
            })?;
        let sources = gather_sources(options)?;
        let resolver = VariableResolver::new(&runbook.variables, self.config.interactive);
        let vars = resolver.overlay(snapshot, &sources)?;

        let report = self
            .engine()
            .resume_run(&runbook, &plan, &vars, run.run_id)
            .await?;
        Ok(report)
    }

    /// Overrides a run's status (orphan repair).
    ///
    /// # Errors
    ///
    /// Returns an `OpsError` when the run does not exist or the store
    /// update fails.
    pub async fn set_status(
        &self,
        workflow_name: &str,
        run_id: i64,
        status: RunStatus,
    ) -> Result<(), OpsError> {
        self.store
            .set_run_status(workflow_name, run_id, status)
            .await
            .map_err(EngineError::from)?;
        Ok(())
    }

    /// Returns the latest run and its execution rows, for display.
    ///
    /// # Errors
    ///
    /// Returns an `OpsError` on store failures.
    pub async fn latest(
        &self,
        workflow_name: &str,
    ) -> Result<Option<(RunRecord, Vec<AttemptRecord>)>, OpsError> {
        let Some(run) = self
            .store
            .latest_run_for(workflow_name)
            .await
            .map_err(EngineError::from)?
        else {
            return Ok(None);
        };
        let executions = self
            .store
            .executions_for(workflow_name, run.run_id)
            .await
            .map_err(EngineError::from)?;
        Ok(Some((run, executions)))
    }

    /// Surfaces an orphaned RUNNING run; never rewrites it.
    async fn surface_orphan(&self, workflow_name: &str) -> Result<(), OpsError> {
        if let Some(latest) = self
            .store
            .latest_run_for(workflow_name)
            .await
            .map_err(EngineError::from)?
            && latest.status == RunStatus::Running
        {
            warn!(
                workflow = %workflow_name,
                run_id = latest.run_id,
                "previous run is still RUNNING; if no executor is alive, repair it with set-status"
            );
        }
        Ok(())
    }

    fn engine(&self) -> Engine<S> {
        let runners = RunnerSet {
            manual: Arc::new(ManualRunner::new(Arc::clone(&self.interactor))),
            command: Arc::new(CommandRunner::new(Arc::clone(&self.process))),
            function: Arc::new(FunctionRunner::new(Arc::clone(&self.registry))),
        };
        Engine::new(
            Arc::clone(&self.store),
            runners,
            Arc::clone(&self.interactor),
            self.config.clone(),
        )
        .with_cancel_token(self.cancel.clone())
    }
}

fn gather_sources(options: &RunOptions) -> Result<VariableSources, OpsError> {
    let mut sources = VariableSources {
        overrides: options.overrides.clone(),
        ..VariableSources::default()
    };
    if let Some(path) = &options.var_file {
        sources.file_values = load_variables_file(path)?;
    }
    if let Some(prefix) = &options.env_prefix {
        sources.env_values = scrape_env(prefix);
    }
    Ok(sources)
}
