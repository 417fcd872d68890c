//! Manual node runner.
//!
//! Presents the node's description and prompt through the [`Interactor`]
//! port and records the operator's ok/nok answer plus an optional note.
//! The attempt timeout bounds the wait; expiry fails the attempt with
//! `manual_timeout` and no operator decision.

use crate::interact::Interactor;
use crate::runner::{Outcome, RenderedAction, RunContext, Runner};
use crate::status::Decision;
use async_trait::async_trait;
use opsrun_runbook::NodeDescriptor;
use std::sync::Arc;

/// Runner for manual gates.
pub struct ManualRunner {
    interactor: Arc<dyn Interactor>,
}

impl ManualRunner {
    /// Creates a manual runner over an interactor.
    #[must_use]
    pub fn new(interactor: Arc<dyn Interactor>) -> Self {
        Self { interactor }
    }
}

#[async_trait]
impl Runner for ManualRunner {
    async fn run(
        &self,
        ctx: &RunContext,
        node: &NodeDescriptor,
        action: &RenderedAction,
    ) -> Outcome {
        let RenderedAction::Manual { prompt } = action else {
            return Outcome::nok("manual runner invoked for a non-manual node");
        };

        let confirm = self
            .interactor
            .confirm(&ctx.node_id, prompt, node.description.as_deref());

        let response = if let Some(timeout) = ctx.timeout {
            tokio::select! {
                response = confirm => response,
                () = ctx.cancel.cancelled() => return Outcome::nok("cancelled"),
                () = tokio::time::sleep(timeout) => {
                    return Outcome::nok("manual_timeout");
                }
            }
        } else {
            tokio::select! {
                response = confirm => response,
                () = ctx.cancel.cancelled() => return Outcome::nok("cancelled"),
            }
        };

        let mut outcome = if response.ok {
            Outcome::ok().with_decision(Decision::Ok)
        } else {
            Outcome::nok("operator answered nok").with_decision(Decision::Nok)
        };
        if let Some(note) = response.note {
            outcome = outcome.with_result_text(note);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interact::{FailureChoice, ManualResponse};
    use crate::runner::OutcomeStatus;
    use opsrun_runbook::{NodeAction, NodeId};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct FixedInteractor {
        ok: bool,
        note: Option<String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Interactor for FixedInteractor {
        async fn confirm(
            &self,
            _node_id: &NodeId,
            _prompt: &str,
            _description: Option<&str>,
        ) -> ManualResponse {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            ManualResponse {
                ok: self.ok,
                note: self.note.clone(),
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

    fn gate_node() -> NodeDescriptor {
        NodeDescriptor::new(
            "gate",
            NodeAction::Manual {
                prompt: "proceed?".to_string(),
            },
        )
    }

    fn ctx(timeout: Option<Duration>) -> RunContext {
        RunContext {
            node_id: NodeId::new("gate"),
            cancel: CancellationToken::new(),
            timeout,
        }
    }

    #[tokio::test]
    async fn ok_answer_with_note() {
        let runner = ManualRunner::new(Arc::new(FixedInteractor {
            ok: true,
            note: Some("checked dashboards".to_string()),
            delay: None,
        }));
        let action = RenderedAction::Manual {
            prompt: "proceed?".to_string(),
        };
        let outcome = runner.run(&ctx(None), &gate_node(), &action).await;
        assert_eq!(outcome.status, OutcomeStatus::Ok);
        assert_eq!(outcome.decision, Decision::Ok);
        assert_eq!(outcome.result_text.as_deref(), Some("checked dashboards"));
    }

    #[tokio::test]
    async fn nok_answer() {
        let runner = ManualRunner::new(Arc::new(FixedInteractor {
            ok: false,
            note: None,
            delay: None,
        }));
        let action = RenderedAction::Manual {
            prompt: "proceed?".to_string(),
        };
        let outcome = runner.run(&ctx(None), &gate_node(), &action).await;
        assert!(outcome.is_nok());
        assert_eq!(outcome.decision, Decision::Nok);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_yields_manual_timeout() {
        let runner = ManualRunner::new(Arc::new(FixedInteractor {
            ok: true,
            note: None,
            delay: Some(Duration::from_secs(60)),
        }));
        let action = RenderedAction::Manual {
            prompt: "proceed?".to_string(),
        };
        let outcome = runner
            .run(&ctx(Some(Duration::from_secs(1))), &gate_node(), &action)
            .await;
        assert!(outcome.is_nok());
        assert_eq!(outcome.exception.as_deref(), Some("manual_timeout"));
        assert_eq!(outcome.decision, Decision::None);
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let runner = ManualRunner::new(Arc::new(FixedInteractor {
            ok: true,
            note: None,
            delay: Some(Duration::from_secs(60)),
        }));
        let action = RenderedAction::Manual {
            prompt: "proceed?".to_string(),
        };
        let ctx = ctx(None);
        ctx.cancel.cancel();
        let outcome = runner.run(&ctx, &gate_node(), &action).await;
        assert!(outcome.is_nok());
        assert_eq!(outcome.exception.as_deref(), Some("cancelled"));
    }
}
