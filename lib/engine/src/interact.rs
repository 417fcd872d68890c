//! Operator interaction port.
//!
//! The engine consults the interactor at two points: manual gates, and the
//! failure-resolution loop after a node attempt fails. The CLI provides a
//! console implementation; tests script answers.

use async_trait::async_trait;
use opsrun_runbook::NodeId;

/// The operator's answer to a manual gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualResponse {
    /// True for ok, false for nok.
    pub ok: bool,
    /// Optional free-text note, recorded as the attempt's result text.
    pub note: Option<String>,
}

/// Choices offered when a node attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureChoice {
    /// Try the node again (new attempt).
    Retry,
    /// Skip the node and continue downstream.
    Skip,
    /// Abort the whole run.
    Abort,
}

/// Port for operator decisions.
#[async_trait]
pub trait Interactor: Send + Sync {
    /// Presents a manual gate and waits for the operator's answer.
    async fn confirm(
        &self,
        node_id: &NodeId,
        prompt: &str,
        description: Option<&str>,
    ) -> ManualResponse;

    /// Asks how to handle a failed attempt. `choices` is never empty.
    async fn resolve_failure(
        &self,
        node_id: &NodeId,
        attempt: i64,
        choices: &[FailureChoice],
    ) -> FailureChoice;
}

/// An interactor for non-interactive contexts: manual gates answer nok,
/// failures pick the first offered choice (retry before skip before abort).
pub struct AutoInteractor;

#[async_trait]
impl Interactor for AutoInteractor {
    async fn confirm(
        &self,
        _node_id: &NodeId,
        _prompt: &str,
        _description: Option<&str>,
    ) -> ManualResponse {
        ManualResponse {
            ok: false,
            note: Some("no interactive terminal".to_string()),
        }
    }

    async fn resolve_failure(
        &self,
        _node_id: &NodeId,
        _attempt: i64,
        choices: &[FailureChoice],
    ) -> FailureChoice {
        choices[0]
    }
}
