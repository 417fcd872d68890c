//! The engine: run-level state machine and dispatch loop.
//!
//! One engine drives one run at a time:
//!
//! 1. Compute the set of nodes whose incoming edges are satisfied
//! 2. Apply gates: author-requested skips and falsy `when` templates become
//!    synthetic SKIPPED rows; descendants of failures without a `:failure`
//!    edge are pruned ("not run", no row)
//! 3. Dispatch ready nodes — one at a time, or all of them when parallel
//!    execution is enabled — through the kind-specific runners
//! 4. Persist every attempt (write-ahead: begin before running, finish
//!    before the next dispatch decision)
//! 5. On failure, walk the retry/skip/abort resolution loop, which blocks
//!    further dispatch until resolved
//!
//! A failed node with a downstream `:failure` edge is a handled failure:
//! the runbook routes it, so the operator is not consulted.

use crate::interact::{FailureChoice, Interactor};
use crate::plan::Plan;
use crate::runner::{Outcome, RenderedAction, RunContext, Runner};
use crate::status::{Decision, NodeStatus, RunStatus, TriggerKind};
use crate::store::{AttemptClose, ExecutionKey, RunCounters, RunStore, StoreError};
use crate::template::{self, StatusSnapshot, TemplateError};
use crate::vars::ResolvedVariables;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use opsrun_runbook::{EdgeCondition, NodeAction, NodeDescriptor, NodeId, NodeKind, Runbook};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Engine configuration, threaded through explicitly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Extra attempts allowed after the first one.
    pub max_retries: u32,
    /// Fallback timeout for nodes that declare none.
    pub default_timeout: Option<Duration>,
    /// Run independent ready nodes concurrently.
    pub parallel: bool,
    /// Consult the operator on failures and manual gates.
    pub interactive: bool,
    /// Bound on operator waits; half of it bounds the cancellation drain.
    pub interactive_timeout: Duration,
    /// Cap on concurrent workers when parallel execution is enabled.
    pub workers: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            default_timeout: None,
            parallel: false,
            interactive: true,
            interactive_timeout: Duration::from_secs(300),
            workers: None,
        }
    }
}

/// The runners, one per node kind.
pub struct RunnerSet {
    pub manual: Arc<dyn Runner>,
    pub command: Arc<dyn Runner>,
    pub function: Arc<dyn Runner>,
}

impl RunnerSet {
    /// Returns the runner for a node kind.
    #[must_use]
    pub fn for_kind(&self, kind: NodeKind) -> Arc<dyn Runner> {
        match kind {
            NodeKind::Manual => Arc::clone(&self.manual),
            NodeKind::Command => Arc::clone(&self.command),
            NodeKind::Function => Arc::clone(&self.function),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub workflow_name: String,
    pub run_id: i64,
    pub status: RunStatus,
    pub counters: RunCounters,
}

impl RunReport {
    /// Process exit code for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// Errors that terminate the engine.
///
/// Node failures never surface here; they are recorded as NOK attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Store failure; fatal during a live run.
    Store(StoreError),
    /// The variables snapshot could not be serialized.
    Snapshot { message: String },
}

impl EngineError {
    /// Stable machine code for the CLI surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.code(),
            Self::Snapshot { .. } => "snapshot_error",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Snapshot { message } => write!(f, "cannot serialize variables: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Engine-internal node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done(NodeStatus),
    /// Descendant of a failure with no `:failure` route; "not run".
    Pruned,
}

/// How one incoming edge currently evaluates.
enum EdgeEval {
    Satisfied,
    Waiting,
    Unsatisfiable,
}

fn eval_edge(dep_state: NodeState, condition: EdgeCondition) -> EdgeEval {
    match dep_state {
        NodeState::Pending | NodeState::Running => EdgeEval::Waiting,
        NodeState::Pruned => EdgeEval::Unsatisfiable,
        NodeState::Done(status) => match (condition, status) {
            (EdgeCondition::AnyTerminal, NodeStatus::Ok | NodeStatus::Skipped)
            | (EdgeCondition::Success, NodeStatus::Ok)
            | (EdgeCondition::Failure, NodeStatus::Nok) => EdgeEval::Satisfied,
            _ => EdgeEval::Unsatisfiable,
        },
    }
}

/// A completed worker: everything needed to persist and resolve the attempt.
struct Finished {
    node: NodeDescriptor,
    action: RenderedAction,
    key: ExecutionKey,
    started: Instant,
    outcome: Outcome,
}

/// What settling a finished attempt decided.
enum Settled {
    /// Node reached a terminal status; the run continues.
    Done(NodeStatus),
    /// Operator aborted the run.
    Aborted,
    /// A critical node exhausted its retries; the run is NOK now.
    CriticalNok,
}

/// The workflow engine.
pub struct Engine<S: RunStore> {
    store: Arc<S>,
    runners: RunnerSet,
    interactor: Arc<dyn Interactor>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl<S: RunStore> Engine<S> {
    /// Creates an engine.
    pub fn new(
        store: Arc<S>,
        runners: RunnerSet,
        interactor: Arc<dyn Interactor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            runners,
            interactor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// The run-wide cancellation token (wire SIGINT to this).
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uses an externally owned cancellation token instead of a fresh one.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a fresh run of a validated plan.
    ///
    /// # Errors
    ///
    /// Returns an `EngineError` on store failures or an unserializable
    /// variables snapshot.
    pub async fn execute(
        &self,
        runbook: &Runbook,
        plan: &Plan,
        vars: &ResolvedVariables,
    ) -> Result<RunReport, EngineError> {
        let snapshot = serde_json::to_string(vars).map_err(|e| EngineError::Snapshot {
            message: e.to_string(),
        })?;
        let run_id = self
            .store
            .create_run(&runbook.name, TriggerKind::Run, &snapshot, &runbook.digest)
            .await?;
        info!(workflow = %runbook.name, run_id, "run started");

        let states = runbook
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::Pending))
            .collect();
        self.drive(runbook, plan, vars, run_id, states).await
    }

    /// Continues an aborted run.
    ///
    /// Terminal nodes keep their recorded status; NOK and PENDING nodes
    /// become runnable again and append new attempts.
    ///
    /// # Errors
    ///
    /// Returns an `EngineError` on store failures.
    pub async fn resume_run(
        &self,
        runbook: &Runbook,
        plan: &Plan,
        vars: &ResolvedVariables,
        run_id: i64,
    ) -> Result<RunReport, EngineError> {
        let mut states: HashMap<NodeId, NodeState> = HashMap::new();
        for node in &runbook.nodes {
            let state = match self
                .store
                .latest_attempt(&runbook.name, run_id, node.id.as_str())
                .await?
            {
                Some(attempt) => match attempt.status {
                    NodeStatus::Ok => NodeState::Done(NodeStatus::Ok),
                    NodeStatus::Skipped => NodeState::Done(NodeStatus::Skipped),
                    NodeStatus::Nok | NodeStatus::Pending => NodeState::Pending,
                },
                None => NodeState::Pending,
            };
            states.insert(node.id.clone(), state);
        }

        self.store
            .set_run_status(&runbook.name, run_id, RunStatus::Running)
            .await?;
        info!(workflow = %runbook.name, run_id, "run resumed");
        self.drive(runbook, plan, vars, run_id, states).await
    }

    async fn drive(
        &self,
        runbook: &Runbook,
        plan: &Plan,
        vars: &ResolvedVariables,
        run_id: i64,
        mut states: HashMap<NodeId, NodeState>,
    ) -> Result<RunReport, EngineError> {
        // Nodes whose failure is routed by a downstream `:failure` edge.
        let failure_handled: HashSet<NodeId> = plan
            .nodes()
            .iter()
            .flat_map(|n| n.deps.iter())
            .filter(|(_, condition)| *condition == EdgeCondition::Failure)
            .map(|(dep, _)| dep.clone())
            .collect();

        let mut inflight: FuturesUnordered<BoxFuture<'static, Finished>> = FuturesUnordered::new();
        let mut open: HashMap<NodeId, (ExecutionKey, Instant)> = HashMap::new();
        let mut aborted = false;
        let mut critical_nok = false;
        let mut terminated = false;

        loop {
            if terminated || self.cancel.is_cancelled() {
                self.drain(&mut inflight, &mut open, &mut states).await?;
                break;
            }

            // Settle gates to a fixpoint, then collect runnable nodes.
            let runnable = loop {
                apply_pruning(plan, &mut states);
                let ready = ready_nodes(plan, &states);

                let mut gated = false;
                let mut runnable = Vec::new();
                for id in ready {
                    let Some(node) = runbook.node(&id) else {
                        continue;
                    };
                    if node.skip {
                        info!(node = %id, "skip requested in runbook");
                        self.synthetic_attempt(
                            &runbook.name,
                            run_id,
                            &id,
                            NodeStatus::Skipped,
                            Decision::Skip,
                            Some("skip requested in runbook"),
                        )
                        .await?;
                        states.insert(id, NodeState::Done(NodeStatus::Skipped));
                        gated = true;
                        continue;
                    }
                    if let Some(when) = &node.when {
                        let snapshot = status_snapshot(&states);
                        let field = format!("{id}.when");
                        match template::render(&field, when, vars, &snapshot) {
                            Ok(rendered) if template::is_falsy_literal(&rendered) => {
                                info!(node = %id, "when condition is false, skipping");
                                self.synthetic_attempt(
                                    &runbook.name,
                                    run_id,
                                    &id,
                                    NodeStatus::Skipped,
                                    Decision::None,
                                    Some("when condition evaluated false"),
                                )
                                .await?;
                                states.insert(id, NodeState::Done(NodeStatus::Skipped));
                                gated = true;
                                continue;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(node = %id, error = %e, "when template failed");
                                self.failed_render_attempt(&runbook.name, run_id, &id, &e)
                                    .await?;
                                states.insert(id, NodeState::Done(NodeStatus::Nok));
                                gated = true;
                                continue;
                            }
                        }
                    }
                    runnable.push(id);
                }
                if !gated {
                    break runnable;
                }
            };

            // Dispatch.
            let cap = if self.config.parallel {
                self.config.workers.unwrap_or(usize::MAX)
            } else {
                1
            };
            let mut render_failed = false;
            for id in runnable {
                if inflight.len() >= cap {
                    break;
                }
                let Some(node) = runbook.node(&id) else {
                    continue;
                };
                let node = node.clone();
                let snapshot = status_snapshot(&states);

                let action = match self.render_action(runbook, &node, vars, &snapshot) {
                    Ok(action) => action,
                    Err(e) => {
                        warn!(node = %id, error = %e, "template rendering failed");
                        self.failed_render_attempt(&runbook.name, run_id, &id, &e)
                            .await?;
                        states.insert(id, NodeState::Done(NodeStatus::Nok));
                        render_failed = true;
                        continue;
                    }
                };

                let attempt = self
                    .store
                    .begin_attempt(&runbook.name, run_id, id.as_str())
                    .await?;
                let key = ExecutionKey {
                    workflow_name: runbook.name.clone(),
                    run_id,
                    node_id: id.to_string(),
                    attempt,
                };
                let started = Instant::now();
                states.insert(id.clone(), NodeState::Running);
                open.insert(id.clone(), (key.clone(), started));

                debug!(node = %id, attempt, "dispatching");
                let runner = self.runners.for_kind(node.kind());
                let ctx = self.run_context(&node);
                inflight.push(Box::pin(async move {
                    let outcome = runner.run(&ctx, &node, &action).await;
                    Finished {
                        node,
                        action,
                        key,
                        started,
                        outcome,
                    }
                }));
            }

            if inflight.is_empty() {
                // A render failure may have unlocked a failure branch.
                if render_failed {
                    continue;
                }
                break;
            }

            let finished = tokio::select! {
                finished = inflight.next() => finished,
                () = self.cancel.cancelled() => {
                    warn!(workflow = %runbook.name, run_id, "cancellation requested");
                    aborted = true;
                    continue;
                }
            };
            let Some(finished) = finished else {
                continue;
            };

            let id = finished.node.id.clone();
            open.remove(&id);
            let handled = failure_handled.contains(&id);
            match self.settle(finished, handled, false).await? {
                Settled::Done(status) => {
                    states.insert(id, NodeState::Done(status));
                }
                Settled::Aborted => {
                    states.insert(id, NodeState::Done(NodeStatus::Nok));
                    aborted = true;
                    terminated = true;
                    self.cancel.cancel();
                }
                Settled::CriticalNok => {
                    states.insert(id, NodeState::Done(NodeStatus::Nok));
                    critical_nok = true;
                    terminated = true;
                    self.cancel.cancel();
                }
            }
        }

        // Finalize. An explicit abort (or cancellation) wins; otherwise a
        // critical NOK escalates; otherwise the run is OK.
        let counters = count_states(&states);
        let any_critical_nok = runbook.nodes.iter().any(|n| {
            n.critical && states.get(&n.id) == Some(&NodeState::Done(NodeStatus::Nok))
        });
        let status = if aborted || self.cancel.is_cancelled() {
            RunStatus::Aborted
        } else if critical_nok || any_critical_nok {
            RunStatus::Nok
        } else {
            RunStatus::Ok
        };

        self.store
            .update_run_status(&runbook.name, run_id, status, counters, Some(chrono::Utc::now()))
            .await?;
        info!(
            workflow = %runbook.name,
            run_id,
            status = %status,
            ok = counters.ok,
            nok = counters.nok,
            skipped = counters.skipped,
            "run finished"
        );

        Ok(RunReport {
            workflow_name: runbook.name.clone(),
            run_id,
            status,
            counters,
        })
    }

    /// Persists a finished attempt and, on failure, walks the
    /// retry/skip/abort resolution loop. Retries re-run the node inline;
    /// parallel dispatch stays blocked until the failure is resolved.
    async fn settle(
        &self,
        finished: Finished,
        failure_handled: bool,
        forced: bool,
    ) -> Result<Settled, EngineError> {
        let Finished {
            node,
            action,
            mut key,
            mut started,
            mut outcome,
        } = finished;

        loop {
            let duration_ms = started.elapsed().as_millis() as i64;

            if !outcome.is_nok() {
                self.store
                    .finish_attempt(
                        &key,
                        close_outcome(&outcome, NodeStatus::Ok, outcome.decision, duration_ms),
                    )
                    .await?;
                info!(node = %node.id, attempt = key.attempt, "node ok");
                return Ok(Settled::Done(NodeStatus::Ok));
            }

            if forced || self.cancel.is_cancelled() {
                let mut close =
                    close_outcome(&outcome, NodeStatus::Nok, outcome.decision, duration_ms);
                if close.exception.is_none() {
                    close.exception = Some("cancelled".to_string());
                }
                self.store.finish_attempt(&key, close).await?;
                return Ok(Settled::Done(NodeStatus::Nok));
            }

            if failure_handled {
                self.store
                    .finish_attempt(
                        &key,
                        close_outcome(&outcome, NodeStatus::Nok, outcome.decision, duration_ms),
                    )
                    .await?;
                info!(
                    node = %node.id,
                    attempt = key.attempt,
                    "node failed; routed to failure branch"
                );
                return Ok(Settled::Done(NodeStatus::Nok));
            }

            let can_retry = key.attempt <= i64::from(self.config.max_retries);
            let resolution = self.resolve(&node, key.attempt, can_retry).await;

            match resolution {
                FailureResolution::Retry => {
                    self.store
                        .finish_attempt(
                            &key,
                            close_outcome(&outcome, NodeStatus::Nok, Decision::Retry, duration_ms),
                        )
                        .await?;
                    let attempt = self
                        .store
                        .begin_attempt(&key.workflow_name, key.run_id, &key.node_id)
                        .await?;
                    info!(node = %node.id, attempt, "retrying");
                    key.attempt = attempt;
                    started = Instant::now();
                    let ctx = self.run_context(&node);
                    let runner = self.runners.for_kind(node.kind());
                    outcome = runner.run(&ctx, &node, &action).await;
                }
                FailureResolution::Skip => {
                    self.store
                        .finish_attempt(
                            &key,
                            close_outcome(&outcome, NodeStatus::Nok, outcome.decision, duration_ms),
                        )
                        .await?;
                    self.synthetic_attempt(
                        &key.workflow_name,
                        key.run_id,
                        &node.id,
                        NodeStatus::Skipped,
                        Decision::Skip,
                        Some("skipped after failure"),
                    )
                    .await?;
                    info!(node = %node.id, "skipped after failure");
                    return Ok(Settled::Done(NodeStatus::Skipped));
                }
                FailureResolution::Abort => {
                    self.store
                        .finish_attempt(
                            &key,
                            close_outcome(&outcome, NodeStatus::Nok, outcome.decision, duration_ms),
                        )
                        .await?;
                    self.synthetic_attempt(
                        &key.workflow_name,
                        key.run_id,
                        &node.id,
                        NodeStatus::Nok,
                        Decision::Abort,
                        Some("aborted by operator"),
                    )
                    .await?;
                    warn!(node = %node.id, "operator aborted the run");
                    return Ok(Settled::Aborted);
                }
                FailureResolution::EscalateNok => {
                    self.store
                        .finish_attempt(
                            &key,
                            close_outcome(&outcome, NodeStatus::Nok, outcome.decision, duration_ms),
                        )
                        .await?;
                    warn!(node = %node.id, "critical node failed; run is nok");
                    return Ok(Settled::CriticalNok);
                }
            }
        }
    }

    /// Picks the failure resolution, consulting the interactor when allowed.
    async fn resolve(
        &self,
        node: &NodeDescriptor,
        attempt: i64,
        can_retry: bool,
    ) -> FailureResolution {
        if node.critical {
            // Skip is never offered for critical nodes; exhausted retries
            // escalate the run immediately.
            if !can_retry {
                return FailureResolution::EscalateNok;
            }
            if !self.config.interactive {
                return FailureResolution::Retry;
            }
            let choices = [FailureChoice::Retry, FailureChoice::Abort];
            return self
                .interactor
                .resolve_failure(&node.id, attempt, &choices)
                .await
                .into();
        }

        if !self.config.interactive {
            return if can_retry {
                FailureResolution::Retry
            } else {
                FailureResolution::Skip
            };
        }

        let mut choices = Vec::with_capacity(3);
        if can_retry {
            choices.push(FailureChoice::Retry);
        }
        choices.push(FailureChoice::Skip);
        choices.push(FailureChoice::Abort);
        self.interactor
            .resolve_failure(&node.id, attempt, &choices)
            .await
            .into()
    }

    /// Waits out in-flight workers after cancellation or termination.
    ///
    /// Completions arriving within half the interactive timeout are
    /// persisted normally; stragglers are dropped and their open rows are
    /// closed as cancelled. Runner outcomes are always persisted before the
    /// run row transitions.
    async fn drain(
        &self,
        inflight: &mut FuturesUnordered<BoxFuture<'static, Finished>>,
        open: &mut HashMap<NodeId, (ExecutionKey, Instant)>,
        states: &mut HashMap<NodeId, NodeState>,
    ) -> Result<(), EngineError> {
        if inflight.is_empty() {
            return Ok(());
        }

        let grace = self.config.interactive_timeout / 2;
        let drained = tokio::time::timeout(grace, async {
            while let Some(finished) = inflight.next().await {
                let id = finished.node.id.clone();
                open.remove(&id);
                let settled = self.settle(finished, false, true).await?;
                if let Settled::Done(status) = settled {
                    states.insert(id, NodeState::Done(status));
                }
            }
            Ok::<(), EngineError>(())
        })
        .await;

        match drained {
            Ok(result) => result,
            Err(_) => {
                warn!("workers did not stop in time; closing open attempts");
                inflight.clear();
                for (id, (key, started)) in open.drain() {
                    let mut close = AttemptClose::with_status(NodeStatus::Nok);
                    close.exception = Some("cancelled".to_string());
                    close.duration_ms = Some(started.elapsed().as_millis() as i64);
                    self.store.finish_attempt(&key, close).await?;
                    states.insert(id, NodeState::Done(NodeStatus::Nok));
                }
                Ok(())
            }
        }
    }

    fn run_context(&self, node: &NodeDescriptor) -> RunContext {
        RunContext {
            node_id: node.id.clone(),
            cancel: self.cancel.clone(),
            timeout: node
                .timeout_secs
                .map(Duration::from_secs)
                .or(self.config.default_timeout),
        }
    }

    /// Renders every templated field of a node's action.
    fn render_action(
        &self,
        runbook: &Runbook,
        node: &NodeDescriptor,
        vars: &ResolvedVariables,
        snapshot: &StatusSnapshot,
    ) -> Result<RenderedAction, TemplateError> {
        match &node.action {
            NodeAction::Manual { prompt } => Ok(RenderedAction::Manual {
                prompt: template::render(&format!("{}.prompt", node.id), prompt, vars, snapshot)?,
            }),
            NodeAction::Command {
                command,
                interactive,
            } => Ok(RenderedAction::Command {
                command: template::render(
                    &format!("{}.command", node.id),
                    command,
                    vars,
                    snapshot,
                )?,
                interactive: *interactive,
            }),
            NodeAction::Function {
                plugin,
                function,
                params,
                plugin_config,
            } => {
                let mut rendered = BTreeMap::new();
                for (name, value) in params {
                    rendered.insert(
                        name.clone(),
                        template::render(
                            &format!("{}.params.{name}", node.id),
                            value,
                            vars,
                            snapshot,
                        )?,
                    );
                }
                // Runbook-level plugin config, overridden per node.
                let mut config = runbook
                    .plugin_config
                    .get(plugin)
                    .cloned()
                    .unwrap_or_default();
                config.extend(plugin_config.clone());
                Ok(RenderedAction::Function {
                    plugin: plugin.clone(),
                    function: function.clone(),
                    params: rendered,
                    config,
                })
            }
        }
    }

    /// Records a synthetic execution row (skips, abort markers).
    async fn synthetic_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &NodeId,
        status: NodeStatus,
        decision: Decision,
        text: Option<&str>,
    ) -> Result<(), EngineError> {
        let attempt = self
            .store
            .begin_attempt(workflow_name, run_id, node_id.as_str())
            .await?;
        let key = ExecutionKey {
            workflow_name: workflow_name.to_string(),
            run_id,
            node_id: node_id.to_string(),
            attempt,
        };
        let mut close = AttemptClose::with_status(status);
        close.operator_decision = decision;
        close.result_text = text.map(str::to_string);
        close.duration_ms = Some(0);
        self.store.finish_attempt(&key, close).await?;
        Ok(())
    }

    /// Records a failed attempt for a template error.
    async fn failed_render_attempt(
        &self,
        workflow_name: &str,
        run_id: i64,
        node_id: &NodeId,
        error: &TemplateError,
    ) -> Result<(), EngineError> {
        let attempt = self
            .store
            .begin_attempt(workflow_name, run_id, node_id.as_str())
            .await?;
        let key = ExecutionKey {
            workflow_name: workflow_name.to_string(),
            run_id,
            node_id: node_id.to_string(),
            attempt,
        };
        let mut close = AttemptClose::with_status(NodeStatus::Nok);
        close.exception = Some(error.to_string());
        close.duration_ms = Some(0);
        self.store.finish_attempt(&key, close).await?;
        Ok(())
    }
}

/// Internal resolution of a failed attempt.
enum FailureResolution {
    Retry,
    Skip,
    Abort,
    EscalateNok,
}

impl From<FailureChoice> for FailureResolution {
    fn from(choice: FailureChoice) -> Self {
        match choice {
            FailureChoice::Retry => Self::Retry,
            FailureChoice::Skip => Self::Skip,
            FailureChoice::Abort => Self::Abort,
        }
    }
}

/// Marks unsatisfiable pending nodes as pruned, to a fixpoint.
fn apply_pruning(plan: &Plan, states: &mut HashMap<NodeId, NodeState>) {
    loop {
        let mut changed = false;
        for node in plan.nodes() {
            if states.get(&node.id) != Some(&NodeState::Pending) {
                continue;
            }
            let unsatisfiable = node.deps.iter().any(|(dep, condition)| {
                let dep_state = states.get(dep).copied().unwrap_or(NodeState::Pending);
                matches!(eval_edge(dep_state, *condition), EdgeEval::Unsatisfiable)
            });
            if unsatisfiable {
                debug!(node = %node.id, "pruned: upstream outcome cannot satisfy edges");
                states.insert(node.id.clone(), NodeState::Pruned);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Pending nodes whose every incoming edge is satisfied, in plan order.
fn ready_nodes(plan: &Plan, states: &HashMap<NodeId, NodeState>) -> Vec<NodeId> {
    plan.order()
        .iter()
        .filter(|id| states.get(*id) == Some(&NodeState::Pending))
        .filter(|id| {
            plan.get(id).is_some_and(|node| {
                node.deps.iter().all(|(dep, condition)| {
                    let dep_state = states.get(dep).copied().unwrap_or(NodeState::Pending);
                    matches!(eval_edge(dep_state, *condition), EdgeEval::Satisfied)
                })
            })
        })
        .cloned()
        .collect()
}

/// Snapshot of terminal node statuses for template predicates.
fn status_snapshot(states: &HashMap<NodeId, NodeState>) -> StatusSnapshot {
    states
        .iter()
        .filter_map(|(id, state)| match state {
            NodeState::Done(status) => Some((id.to_string(), *status)),
            _ => None,
        })
        .collect()
}

fn count_states(states: &HashMap<NodeId, NodeState>) -> RunCounters {
    let mut counters = RunCounters::default();
    for state in states.values() {
        match state {
            NodeState::Done(NodeStatus::Ok) => counters.ok += 1,
            NodeState::Done(NodeStatus::Nok) => counters.nok += 1,
            NodeState::Done(NodeStatus::Skipped) => counters.skipped += 1,
            _ => {}
        }
    }
    counters
}

fn close_outcome(
    outcome: &Outcome,
    status: NodeStatus,
    decision: Decision,
    duration_ms: i64,
) -> AttemptClose {
    AttemptClose {
        status,
        operator_decision: decision,
        result_text: outcome.result_text.clone(),
        exit_code: outcome.exit_code,
        exception: outcome.exception.clone(),
        stdout: outcome.stdout.clone(),
        stderr: outcome.stderr.clone(),
        duration_ms: Some(duration_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interact::ManualResponse;
    use crate::manual::ManualRunner;
    use crate::plan;
    use crate::store::{AttemptRecord, MemoryStore};
    use async_trait::async_trait;
    use chrono::Utc;
    use opsrun_core::VarValue;
    use opsrun_runbook::{DependencyRef, DependsOn, RunbookMeta};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Runner double that replays scripted outcomes per node.
    struct ScriptedRunner {
        outcomes: Mutex<HashMap<String, VecDeque<Outcome>>>,
        commands: Mutex<Vec<String>>,
        cancel_on: Mutex<Option<(String, CancellationToken)>>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(HashMap::new()),
                commands: Mutex::new(Vec::new()),
                cancel_on: Mutex::new(None),
            }
        }

        fn script(&self, node: &str, outcomes: Vec<Outcome>) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(node.to_string(), outcomes.into());
        }

        /// Simulates SIGINT arriving while `node` is in flight.
        fn cancel_when(&self, node: &str, token: CancellationToken) {
            *self.cancel_on.lock().unwrap() = Some((node.to_string(), token));
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        async fn run(
            &self,
            _ctx: &RunContext,
            node: &NodeDescriptor,
            action: &RenderedAction,
        ) -> Outcome {
            if let RenderedAction::Command { command, .. } = action {
                self.commands.lock().unwrap().push(command.clone());
            }
            if let Some((target, token)) = &*self.cancel_on.lock().unwrap()
                && node.id.as_str() == target.as_str()
            {
                token.cancel();
                return Outcome::nok("cancelled");
            }
            self.outcomes
                .lock()
                .unwrap()
                .get_mut(node.id.as_str())
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(Outcome::ok)
        }
    }

    /// Interactor double with scripted failure choices and manual answers.
    struct ScriptedInteractor {
        choices: Mutex<VecDeque<FailureChoice>>,
        manual: Mutex<VecDeque<ManualResponse>>,
    }

    impl ScriptedInteractor {
        fn new(choices: Vec<FailureChoice>) -> Self {
            Self {
                choices: Mutex::new(choices.into()),
                manual: Mutex::new(VecDeque::new()),
            }
        }

        fn with_manual(self, answers: Vec<ManualResponse>) -> Self {
            *self.manual.lock().unwrap() = answers.into();
            self
        }
    }

    #[async_trait]
    impl Interactor for ScriptedInteractor {
        async fn confirm(
            &self,
            _node_id: &NodeId,
            _prompt: &str,
            _description: Option<&str>,
        ) -> ManualResponse {
            self.manual
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ManualResponse {
                    ok: true,
                    note: None,
                })
        }

        async fn resolve_failure(
            &self,
            _node_id: &NodeId,
            _attempt: i64,
            choices: &[FailureChoice],
        ) -> FailureChoice {
            self.choices
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(choices[0])
        }
    }

    fn command_node(id: &str, command: &str) -> NodeDescriptor {
        NodeDescriptor::new(
            id,
            NodeAction::Command {
                command: command.to_string(),
                interactive: false,
            },
        )
    }

    fn runbook(nodes: Vec<NodeDescriptor>) -> Runbook {
        Runbook {
            name: "wf".to_string(),
            meta: RunbookMeta {
                title: "Test".to_string(),
                description: None,
                version: "1".to_string(),
                author: None,
                created_at: Utc::now(),
            },
            variables: Vec::new(),
            nodes,
            plugin_config: BTreeMap::new(),
            digest: "0".repeat(64),
        }
    }

    fn explicit(target: &str, condition: EdgeCondition) -> DependsOn {
        DependsOn::explicit(vec![DependencyRef {
            target: NodeId::new(target),
            condition,
        }])
    }

    fn engine_with(
        store: Arc<MemoryStore>,
        runner: Arc<ScriptedRunner>,
        interactor: Arc<dyn Interactor>,
        config: EngineConfig,
    ) -> Engine<MemoryStore> {
        let runners = RunnerSet {
            manual: runner.clone(),
            command: runner.clone(),
            function: runner,
        };
        Engine::new(store, runners, interactor, config)
    }

    async fn node_rows(store: &MemoryStore, node: &str) -> Vec<AttemptRecord> {
        store
            .executions_for("wf", 1)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.node_id == node)
            .collect()
    }

    #[tokio::test]
    async fn linear_happy_path() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let rb = runbook(vec![
            command_node("a", "step-a"),
            command_node("b", "step-b"),
            command_node("c", "step-c"),
        ]);
        let plan = plan::plan(&rb).unwrap();
        let vars = ResolvedVariables::new();

        let report = engine.execute(&rb, &plan, &vars).await.unwrap();
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.counters,
            RunCounters {
                ok: 3,
                nok: 0,
                skipped: 0
            }
        );

        for node in ["a", "b", "c"] {
            let rows = node_rows(&store, node).await;
            assert_eq!(rows.len(), 1, "node {node} should have one attempt");
            assert_eq!(rows[0].attempt, 1);
            assert_eq!(rows[0].status, NodeStatus::Ok);
        }

        let run = store.get_run("wf", 1).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Ok);
        assert!(run.end_time.is_some());
    }

    #[tokio::test]
    async fn retry_then_success() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("b", vec![Outcome::nok("transient"), Outcome::ok()]);
        let interactor = Arc::new(ScriptedInteractor::new(vec![FailureChoice::Retry]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let rb = runbook(vec![command_node("a", "a"), command_node("b", "b")]);
        let plan = plan::plan(&rb).unwrap();
        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        let rows = node_rows(&store, "b").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, NodeStatus::Nok);
        assert_eq!(rows[0].operator_decision, Decision::Retry);
        assert_eq!(rows[1].status, NodeStatus::Ok);
        assert_eq!(rows[1].attempt, 2);
    }

    #[tokio::test]
    async fn skip_after_exhausted_retries() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script(
            "a",
            vec![
                Outcome::nok("boom"),
                Outcome::nok("boom"),
                Outcome::nok("boom"),
            ],
        );
        let interactor = Arc::new(ScriptedInteractor::new(vec![
            FailureChoice::Retry,
            FailureChoice::Retry,
            FailureChoice::Skip,
        ]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig {
                max_retries: 2,
                ..EngineConfig::default()
            },
        );

        let rb = runbook(vec![command_node("a", "a"), command_node("b", "b")]);
        let plan = plan::plan(&rb).unwrap();
        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(
            report.counters,
            RunCounters {
                ok: 1,
                nok: 0,
                skipped: 1
            }
        );

        let rows = node_rows(&store, "a").await;
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].operator_decision, Decision::Retry);
        assert_eq!(rows[1].operator_decision, Decision::Retry);
        assert_eq!(rows[2].status, NodeStatus::Nok);
        assert_eq!(rows[2].operator_decision, Decision::None);
        assert_eq!(rows[3].status, NodeStatus::Skipped);
        assert_eq!(rows[3].operator_decision, Decision::Skip);
        // Attempts are dense 1..4.
        assert_eq!(
            rows.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        // Downstream executed after the skip.
        assert_eq!(node_rows(&store, "b").await.len(), 1);
    }

    #[tokio::test]
    async fn critical_failure_abort() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("deploy", vec![Outcome::nok("boom")]);
        let interactor = Arc::new(ScriptedInteractor::new(vec![FailureChoice::Abort]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let mut deploy = command_node("deploy", "deploy");
        deploy.critical = true;
        let rb = runbook(vec![deploy, command_node("verify", "verify")]);
        let plan = plan::plan(&rb).unwrap();
        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(report.exit_code(), 2);

        let rows = node_rows(&store, "deploy").await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, NodeStatus::Nok);
        assert_eq!(rows[1].operator_decision, Decision::Abort);

        // Downstream never attempted.
        assert!(node_rows(&store, "verify").await.is_empty());
    }

    #[tokio::test]
    async fn critical_exhausted_escalates_to_nok() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("deploy", vec![Outcome::nok("boom")]);
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig {
                max_retries: 0,
                ..EngineConfig::default()
            },
        );

        let mut deploy = command_node("deploy", "deploy");
        deploy.critical = true;
        let rb = runbook(vec![deploy, command_node("verify", "verify")]);
        let plan = plan::plan(&rb).unwrap();
        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Nok);
        assert_eq!(report.exit_code(), 1);
        assert!(node_rows(&store, "verify").await.is_empty());
    }

    #[tokio::test]
    async fn conditional_branching_routes_failure() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("build", vec![Outcome::nok("compile error")]);
        // No interactor choices: a handled failure must not consult it.
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let build = command_node("build", "make");
        let mut deploy = command_node("deploy", "deploy.sh");
        deploy.depends_on = explicit("build", EdgeCondition::Success);
        let mut rollback = command_node("rollback", "rollback.sh");
        rollback.depends_on = explicit("build", EdgeCondition::Failure);
        let rb = runbook(vec![build, deploy, rollback]);
        let plan = plan::plan(&rb).unwrap();

        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        // build failed once, no retry/skip prompt.
        let build_rows = node_rows(&store, "build").await;
        assert_eq!(build_rows.len(), 1);
        assert_eq!(build_rows[0].status, NodeStatus::Nok);
        // deploy was never attempted ("not run").
        assert!(node_rows(&store, "deploy").await.is_empty());
        // rollback ran to completion.
        let rollback_rows = node_rows(&store, "rollback").await;
        assert_eq!(rollback_rows.len(), 1);
        assert_eq!(rollback_rows[0].status, NodeStatus::Ok);

        assert_eq!(
            report.counters,
            RunCounters {
                ok: 1,
                nok: 1,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn cancellation_then_resume() {
        let store = Arc::new(MemoryStore::new());
        let rb = runbook(vec![
            command_node("a", "a"),
            command_node("b", "b"),
            command_node("c", "c"),
            command_node("d", "d"),
        ]);
        let plan = plan::plan(&rb).unwrap();

        // First run: interrupted while b is in flight.
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner.clone(),
            interactor,
            EngineConfig::default(),
        );
        runner.cancel_when("b", engine.cancel_token());

        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Aborted);

        assert_eq!(node_rows(&store, "a").await.len(), 1);
        let b_rows = node_rows(&store, "b").await;
        assert_eq!(b_rows.len(), 1);
        assert_eq!(b_rows[0].status, NodeStatus::Nok);
        assert_eq!(b_rows[0].exception.as_deref(), Some("cancelled"));
        assert!(node_rows(&store, "c").await.is_empty());
        assert!(node_rows(&store, "d").await.is_empty());

        // Resume: a keeps its row, b re-attempts, c and d run.
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );
        let report = engine
            .resume_run(&rb, &plan, &ResolvedVariables::new(), 1)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(node_rows(&store, "a").await.len(), 1);
        let b_rows = node_rows(&store, "b").await;
        assert_eq!(b_rows.len(), 2);
        assert_eq!(b_rows[1].attempt, 2);
        assert_eq!(b_rows[1].status, NodeStatus::Ok);
        assert_eq!(node_rows(&store, "c").await.len(), 1);
        assert_eq!(node_rows(&store, "d").await.len(), 1);
    }

    #[tokio::test]
    async fn templates_render_against_resolved_variables() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner.clone(),
            interactor,
            EngineConfig::default(),
        );

        let rb = runbook(vec![command_node("deploy", "deploy.sh {{ENV}}")]);
        let plan = plan::plan(&rb).unwrap();
        let vars: ResolvedVariables = [("ENV".to_string(), VarValue::Str("prod".to_string()))]
            .into_iter()
            .collect();

        engine.execute(&rb, &plan, &vars).await.unwrap();
        assert_eq!(runner.commands(), vec!["deploy.sh prod".to_string()]);
    }

    #[tokio::test]
    async fn falsy_when_becomes_synthetic_skip() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let a = command_node("a", "a");
        let mut b = command_node("b", "b");
        b.when = Some("{{RUN_B}}".to_string());
        let c = command_node("c", "c");
        let rb = runbook(vec![a, b, c]);
        let plan = plan::plan(&rb).unwrap();
        let vars: ResolvedVariables = [("RUN_B".to_string(), VarValue::Str("false".to_string()))]
            .into_iter()
            .collect();

        let report = engine.execute(&rb, &plan, &vars).await.unwrap();
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(
            report.counters,
            RunCounters {
                ok: 2,
                nok: 0,
                skipped: 1
            }
        );

        let b_rows = node_rows(&store, "b").await;
        assert_eq!(b_rows.len(), 1);
        assert_eq!(b_rows[0].status, NodeStatus::Skipped);
        assert_eq!(b_rows[0].operator_decision, Decision::None);
        // c still runs: skipped satisfies its implicit edge.
        assert_eq!(node_rows(&store, "c").await.len(), 1);
    }

    #[tokio::test]
    async fn author_requested_skip() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let a = command_node("a", "a");
        let mut b = command_node("b", "b");
        b.skip = true;
        let rb = runbook(vec![a, b]);
        let plan = plan::plan(&rb).unwrap();

        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Ok);

        let b_rows = node_rows(&store, "b").await;
        assert_eq!(b_rows.len(), 1);
        assert_eq!(b_rows[0].status, NodeStatus::Skipped);
        assert_eq!(b_rows[0].operator_decision, Decision::Skip);
    }

    #[tokio::test]
    async fn pruning_cascades_past_failed_upstream() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("a", vec![Outcome::nok("boom")]);
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        // a fails; cleanup takes the failure branch; b -> c are pruned.
        let a = command_node("a", "a");
        let mut cleanup = command_node("cleanup", "cleanup");
        cleanup.depends_on = explicit("a", EdgeCondition::Failure);
        let mut b = command_node("b", "b");
        b.depends_on = explicit("a", EdgeCondition::AnyTerminal);
        let mut c = command_node("c", "c");
        c.depends_on = explicit("b", EdgeCondition::AnyTerminal);
        let rb = runbook(vec![a, cleanup, b, c]);
        let plan = plan::plan(&rb).unwrap();

        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        assert!(node_rows(&store, "b").await.is_empty());
        assert!(node_rows(&store, "c").await.is_empty());
        assert_eq!(node_rows(&store, "cleanup").await.len(), 1);
        assert_eq!(
            report.counters,
            RunCounters {
                ok: 1,
                nok: 1,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn non_interactive_retries_then_forces_skip() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        runner.script("a", vec![Outcome::nok("boom"), Outcome::nok("boom")]);
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig {
                max_retries: 1,
                interactive: false,
                ..EngineConfig::default()
            },
        );

        let rb = runbook(vec![command_node("a", "a"), command_node("b", "b")]);
        let plan = plan::plan(&rb).unwrap();
        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Ok);
        let rows = node_rows(&store, "a").await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].operator_decision, Decision::Retry);
        assert_eq!(rows[1].operator_decision, Decision::None);
        assert_eq!(rows[2].status, NodeStatus::Skipped);
        assert_eq!(node_rows(&store, "b").await.len(), 1);
    }

    #[tokio::test]
    async fn parallel_execution_completes_independent_branches() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig {
                parallel: true,
                ..EngineConfig::default()
            },
        );

        let a = command_node("a", "a");
        let mut b = command_node("b", "b");
        b.depends_on = DependsOn::Explicit { refs: vec![] };
        let mut join = command_node("join", "join");
        join.depends_on = DependsOn::explicit(vec![
            DependencyRef {
                target: NodeId::new("a"),
                condition: EdgeCondition::AnyTerminal,
            },
            DependencyRef {
                target: NodeId::new("b"),
                condition: EdgeCondition::AnyTerminal,
            },
        ]);
        let rb = runbook(vec![a, b, join]);
        let plan = plan::plan(&rb).unwrap();

        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Ok);
        assert_eq!(
            report.counters,
            RunCounters {
                ok: 3,
                nok: 0,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn manual_gate_records_decision_and_note() {
        let store = Arc::new(MemoryStore::new());
        let scripted = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]).with_manual(vec![
            ManualResponse {
                ok: true,
                note: Some("dashboards look good".to_string()),
            },
        ]));
        let runners = RunnerSet {
            manual: Arc::new(ManualRunner::new(interactor.clone())),
            command: scripted.clone(),
            function: scripted,
        };
        let engine = Engine::new(
            store.clone(),
            runners,
            interactor,
            EngineConfig::default(),
        );

        let gate = NodeDescriptor::new(
            "gate",
            NodeAction::Manual {
                prompt: "continue with {{ENV}}?".to_string(),
            },
        );
        let rb = runbook(vec![gate, command_node("next", "next")]);
        let plan = plan::plan(&rb).unwrap();
        let vars: ResolvedVariables = [("ENV".to_string(), VarValue::Str("prod".to_string()))]
            .into_iter()
            .collect();

        let report = engine.execute(&rb, &plan, &vars).await.unwrap();
        assert_eq!(report.status, RunStatus::Ok);

        let rows = node_rows(&store, "gate").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeStatus::Ok);
        assert_eq!(rows[0].operator_decision, Decision::Ok);
        assert_eq!(rows[0].result_text.as_deref(), Some("dashboards look good"));
    }

    #[tokio::test]
    async fn template_failure_burns_an_attempt_and_prunes_downstream() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(ScriptedRunner::new());
        let interactor = Arc::new(ScriptedInteractor::new(vec![]));
        let engine = engine_with(
            store.clone(),
            runner,
            interactor,
            EngineConfig::default(),
        );

        let mut a = command_node("a", "{% if %}");
        a.depends_on = DependsOn::Explicit { refs: vec![] };
        let b = command_node("b", "b");
        let rb = runbook(vec![a, b]);
        let plan = plan::plan(&rb).unwrap();

        let report = engine
            .execute(&rb, &plan, &ResolvedVariables::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Ok);

        let rows = node_rows(&store, "a").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeStatus::Nok);
        assert!(
            rows[0]
                .exception
                .as_deref()
                .is_some_and(|e| e.contains("template error"))
        );
        assert!(node_rows(&store, "b").await.is_empty());
    }
}
