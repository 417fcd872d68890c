//! Core workflow engine for the opsrun runbook executor.
//!
//! This crate provides:
//!
//! - **Planner**: dependency expansion, DAG validation, stable ordering
//! - **Variables + Templates**: precedence merge, typed coercion, minijinja
//!   rendering with runtime status predicates
//! - **Store**: durable run/attempt persistence (SQLite) behind a port,
//!   with an in-memory implementation for tests
//! - **Runners**: manual gates, shell commands, plugin functions — each
//!   behind narrow ports (Interactor, ProcessRunner, PluginRegistry)
//! - **Engine**: the dispatch loop with retry/skip/abort resolution,
//!   resume, and cooperative cancellation

pub mod api;
pub mod command;
pub mod engine;
pub mod function;
pub mod interact;
pub mod manual;
pub mod plan;
pub mod runner;
pub mod sqlite;
pub mod status;
pub mod store;
pub mod template;
pub mod vars;

pub use api::{Executor, OpsError, RunOptions, StateError, exit_code, validate};
pub use command::{CommandRunner, ProcessRunner, TokioProcessRunner};
pub use engine::{Engine, EngineConfig, EngineError, RunReport, RunnerSet};
pub use function::{
    BuiltinPlugin, FunctionRunner, FunctionSignature, ParamSpec, Plugin, PluginError,
    PluginRegistry, StaticRegistry,
};
pub use interact::{AutoInteractor, FailureChoice, Interactor, ManualResponse};
pub use manual::ManualRunner;
pub use plan::{Plan, PlanError, PlanNode};
pub use runner::{Outcome, OutcomeStatus, RenderedAction, RunContext, Runner};
pub use sqlite::SqliteStore;
pub use status::{Decision, NodeStatus, RunStatus, TriggerKind};
pub use store::{
    AttemptClose, AttemptRecord, ExecutionKey, MemoryStore, RunCounters, RunRecord, RunStore,
    StoreError,
};
pub use template::{StatusSnapshot, TemplateError};
pub use vars::{
    NoPrompter, Prompter, ResolvedVariables, VariableError, VariableResolver, VariableSources,
    scrape_env,
};
