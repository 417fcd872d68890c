//! Runbook node types.
//!
//! Nodes are the steps of a runbook. Each node has:
//! - An identifier, unique within the runbook (the TOML section key)
//! - A kind-specific action (Manual, Command, Function)
//! - A dependency expression
//! - Flags: critical, skip-requested, timeout

use crate::depends::DependsOn;
use opsrun_core::VarValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a node within a runbook.
///
/// Node ids are author-chosen strings (TOML section keys).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Operator confirmation gate.
    Manual,
    /// Shell command.
    Command,
    /// Plugin function call.
    Function,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => f.write_str("manual"),
            Self::Command => f.write_str("command"),
            Self::Function => f.write_str("function"),
        }
    }
}

/// Kind-specific node payload.
///
/// String fields may contain templates; they are rendered against the
/// resolved variables before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAction {
    /// Present a prompt and wait for operator ok/nok.
    Manual {
        /// The prompt shown to the operator.
        prompt: String,
    },
    /// Execute a shell command.
    Command {
        /// The command line (templated).
        command: String,
        /// Attach the command to the terminal instead of capturing output.
        interactive: bool,
    },
    /// Call a registered plugin function.
    Function {
        /// The plugin name.
        plugin: String,
        /// The function name within the plugin.
        function: String,
        /// Parameter templates, keyed by parameter name.
        params: BTreeMap<String, String>,
        /// Per-node plugin configuration, overlaid on the runbook-level table.
        plugin_config: BTreeMap<String, VarValue>,
    },
}

impl NodeAction {
    /// Returns the kind of this action.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Manual { .. } => NodeKind::Manual,
            Self::Command { .. } => NodeKind::Command,
            Self::Function { .. } => NodeKind::Function,
        }
    }
}

/// A runbook node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique identifier within the runbook.
    pub id: NodeId,
    /// What the node does.
    pub action: NodeAction,
    /// Dependency expression.
    pub depends_on: DependsOn,
    /// A NOK terminal status on a critical node escalates the whole run.
    pub critical: bool,
    /// The author asked for this node to be skipped.
    pub skip: bool,
    /// Per-node timeout in seconds; falls back to the engine default.
    pub timeout_secs: Option<u64>,
    /// Conditional gate template; a falsy render skips the node.
    pub when: Option<String>,
    /// Free-form description shown to operators.
    pub description: Option<String>,
}

impl NodeDescriptor {
    /// Creates a node with default flags and implicit dependencies.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, action: NodeAction) -> Self {
        Self {
            id: id.into(),
            action,
            depends_on: DependsOn::Implicit,
            critical: false,
            skip: false,
            timeout_secs: None,
            when: None,
            description: None,
        }
    }

    /// Returns the kind of this node.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.action.kind()
    }
}
