//! Node runner contract.
//!
//! Runners execute one node attempt and always return an [`Outcome`]; node
//! failures are values, not errors. Only truly exceptional conditions
//! (store failures) propagate through the engine as errors.

use crate::status::Decision;
use async_trait::async_trait;
use opsrun_core::VarValue;
use opsrun_runbook::{NodeDescriptor, NodeId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Terminal status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Ok,
    Nok,
}

/// The result of running one node attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: OutcomeStatus,
    /// Operator decision captured during the attempt (manual gates).
    pub decision: Decision,
    pub result_text: Option<String>,
    pub exit_code: Option<i64>,
    pub exception: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl Outcome {
    /// A successful outcome.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: OutcomeStatus::Ok,
            decision: Decision::None,
            result_text: None,
            exit_code: None,
            exception: None,
            stdout: None,
            stderr: None,
        }
    }

    /// A failed outcome with an exception tag.
    #[must_use]
    pub fn nok(exception: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Nok,
            decision: Decision::None,
            result_text: None,
            exit_code: None,
            exception: Some(exception.into()),
            stdout: None,
            stderr: None,
        }
    }

    /// Sets the result text.
    #[must_use]
    pub fn with_result_text(mut self, text: impl Into<String>) -> Self {
        self.result_text = Some(text.into());
        self
    }

    /// Sets the operator decision.
    #[must_use]
    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = decision;
        self
    }

    /// Returns true if the attempt failed.
    #[must_use]
    pub fn is_nok(&self) -> bool {
        self.status == OutcomeStatus::Nok
    }
}

/// Per-attempt execution context.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The node being attempted.
    pub node_id: NodeId,
    /// Cooperative cancellation; shared by all in-flight runners.
    pub cancel: CancellationToken,
    /// Attempt timeout (node timeout, or the engine default).
    pub timeout: Option<Duration>,
}

/// A node action with all templates rendered.
///
/// Function parameters stay as strings here; typed coercion happens in the
/// function runner once the plugin's declared signature is known.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedAction {
    Manual {
        prompt: String,
    },
    Command {
        command: String,
        interactive: bool,
    },
    Function {
        plugin: String,
        function: String,
        params: BTreeMap<String, String>,
        config: BTreeMap<String, VarValue>,
    },
}

/// Executes one attempt of a node.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runs the node. Must honor `ctx.cancel` and `ctx.timeout`.
    async fn run(&self, ctx: &RunContext, node: &NodeDescriptor, action: &RenderedAction)
    -> Outcome;
}
