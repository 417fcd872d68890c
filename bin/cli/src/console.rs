//! Console implementations of the operator-facing ports.
//!
//! Reads answers line by line from stdin (via blocking tasks so the
//! engine's select loops stay responsive to cancellation).

use async_trait::async_trait;
use opsrun_engine::{FailureChoice, Interactor, ManualResponse, Prompter};
use opsrun_runbook::{NodeId, VariableSpec};

/// Reads one trimmed line from stdin; `None` on EOF.
async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    })
    .await
    .ok()
    .flatten()
}

/// Interactor that prompts on the terminal.
pub struct ConsoleInteractor;

#[async_trait]
impl Interactor for ConsoleInteractor {
    async fn confirm(
        &self,
        node_id: &NodeId,
        prompt: &str,
        description: Option<&str>,
    ) -> ManualResponse {
        println!();
        println!("=== manual step: {node_id} ===");
        if let Some(description) = description {
            println!("{description}");
        }
        println!("{prompt}");

        let ok = loop {
            println!("answer [ok/nok]: ");
            match read_line().await.as_deref() {
                Some("ok" | "o" | "y" | "yes") => break true,
                Some("nok" | "n" | "no") => break false,
                Some(_) => continue,
                // EOF counts as a refusal, not a confirmation.
                None => break false,
            }
        };

        println!("note (optional): ");
        let note = read_line().await.filter(|n| !n.is_empty());
        ManualResponse { ok, note }
    }

    async fn resolve_failure(
        &self,
        node_id: &NodeId,
        attempt: i64,
        choices: &[FailureChoice],
    ) -> FailureChoice {
        let labels: Vec<&str> = choices
            .iter()
            .map(|c| match c {
                FailureChoice::Retry => "retry",
                FailureChoice::Skip => "skip",
                FailureChoice::Abort => "abort",
            })
            .collect();
        println!();
        println!("node '{node_id}' failed (attempt {attempt})");

        loop {
            println!("choose [{}]: ", labels.join("/"));
            let answer = match read_line().await {
                Some(answer) => answer,
                // EOF: abort is always a legal choice.
                None => return FailureChoice::Abort,
            };
            let picked = match answer.as_str() {
                "retry" | "r" => Some(FailureChoice::Retry),
                "skip" | "s" => Some(FailureChoice::Skip),
                "abort" | "a" => Some(FailureChoice::Abort),
                _ => None,
            };
            if let Some(picked) = picked
                && choices.contains(&picked)
            {
                return picked;
            }
        }
    }
}

/// Prompter that asks for missing required variables on the terminal.
pub struct ConsolePrompter;

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn prompt(&self, spec: &VariableSpec) -> Option<String> {
        println!();
        println!("variable '{}' is required", spec.name);
        if let Some(description) = &spec.description {
            println!("{description}");
        }
        if let Some(choices) = &spec.choices {
            let rendered: Vec<String> = choices.iter().map(ToString::to_string).collect();
            println!("choices: {}", rendered.join(", "));
        }
        println!("value: ");
        read_line().await.filter(|v| !v.is_empty())
    }
}
