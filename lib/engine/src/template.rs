//! Template rendering.
//!
//! Every templated field (commands, prompts, function parameters, `when`
//! gates) renders against the frozen variable snapshot plus two runtime
//! predicates that reflect engine state:
//!
//! - `has_succeeded(node_id)` — the node's current status is OK
//! - `has_failed(node_id)` — the node's current status is NOK
//!
//! The expression language is minijinja: substitution (`{{NAME}}`),
//! defaults (`{{NAME|default('x')}}`), filters (`upper`, `lower`, `join`),
//! conditionals, and loops.

use crate::status::NodeStatus;
use crate::vars::ResolvedVariables;
use minijinja::Environment;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A point-in-time view of node statuses for the runtime predicates.
pub type StatusSnapshot = HashMap<String, NodeStatus>;

/// Error from rendering a templated field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    /// Which field failed, e.g. `deploy.command`.
    pub field_path: String,
    /// The underlying render error.
    pub message: String,
}

impl TemplateError {
    /// Stable machine code for the CLI surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        "template_error"
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template error at {}: {}", self.field_path, self.message)
    }
}

impl std::error::Error for TemplateError {}

/// Renders a templated field.
///
/// # Errors
///
/// Returns a `TemplateError` carrying the field path when the template is
/// malformed or a filter/function invocation fails.
pub fn render(
    field_path: &str,
    template: &str,
    vars: &ResolvedVariables,
    statuses: &StatusSnapshot,
) -> Result<String, TemplateError> {
    // Fast path: nothing to render.
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }

    let mut env = Environment::new();

    let succeeded: Arc<Vec<String>> = Arc::new(
        statuses
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Ok)
            .map(|(id, _)| id.clone())
            .collect(),
    );
    let failed: Arc<Vec<String>> = Arc::new(
        statuses
            .iter()
            .filter(|(_, s)| **s == NodeStatus::Nok)
            .map(|(id, _)| id.clone())
            .collect(),
    );

    env.add_function("has_succeeded", move |node: String| {
        succeeded.contains(&node)
    });
    env.add_function("has_failed", move |node: String| failed.contains(&node));

    env.render_str(template, vars)
        .map_err(|e| TemplateError {
            field_path: field_path.to_string(),
            message: e.to_string(),
        })
}

/// Returns true if a rendered `when` result is a falsy literal.
///
/// Falsy literals: `"false"`, `"0"`, `"no"`, `""` (after trimming,
/// case-insensitive).
#[must_use]
pub fn is_falsy_literal(rendered: &str) -> bool {
    matches!(
        rendered.trim().to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | ""
    )
}
