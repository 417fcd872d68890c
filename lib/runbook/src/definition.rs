//! Runbook definition types.
//!
//! A runbook is a named, versioned description of an operational workflow:
//! metadata, variable specifications, and an ordered list of nodes.
//! Declaration order of the nodes is semantic: implicit and `^`/`*`
//! dependencies refer to it.

use crate::node::{NodeDescriptor, NodeId};
use crate::variable::VariableSpec;
use chrono::{DateTime, Utc};
use opsrun_core::VarValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata for a runbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunbookMeta {
    /// Human-readable title.
    pub title: String,
    /// Description of what this runbook does.
    pub description: Option<String>,
    /// Version string of this runbook definition.
    pub version: String,
    /// Author attribution.
    pub author: Option<String>,
    /// When this runbook was authored (RFC 3339 in the file).
    pub created_at: DateTime<Utc>,
}

/// An immutable runbook, as loaded from a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runbook {
    /// The workflow name (file stem); key for runs in the store.
    pub name: String,
    /// Metadata from the `[runbook]` section.
    pub meta: RunbookMeta,
    /// Declared variables, in declaration order.
    pub variables: Vec<VariableSpec>,
    /// Nodes in declaration order.
    pub nodes: Vec<NodeDescriptor>,
    /// Runbook-level plugin configuration, keyed by plugin name.
    pub plugin_config: BTreeMap<String, BTreeMap<String, VarValue>>,
    /// SHA-256 digest of the source file, hex-encoded.
    pub digest: String,
}

impl Runbook {
    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns the declaration index of a node.
    #[must_use]
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    /// Looks up a variable spec by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }
}
