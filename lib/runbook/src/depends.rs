//! Dependency expressions.
//!
//! Each node carries one dependency expression:
//! - omitted: the previous node in declaration order (none for the first)
//! - `"^"`: the previous node, explicitly
//! - `"*"`: all nodes declared before this one
//! - a single identifier, or an array of identifiers, each optionally
//!   suffixed `:success` or `:failure`

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition qualifier on a dependency edge.
///
/// Unqualified edges are satisfied by any non-failed terminal status of the
/// upstream node. Qualified edges gate on the concrete outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Upstream OK or SKIPPED satisfies the edge.
    #[default]
    AnyTerminal,
    /// Only upstream OK satisfies the edge.
    Success,
    /// Only upstream NOK satisfies the edge.
    Failure,
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnyTerminal => f.write_str("any"),
            Self::Success => f.write_str("success"),
            Self::Failure => f.write_str("failure"),
        }
    }
}

/// A reference to an upstream node, with its condition qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    /// The upstream node id.
    pub target: NodeId,
    /// The condition qualifier.
    pub condition: EdgeCondition,
}

impl DependencyRef {
    /// Parses a dependency reference, e.g. `"build"` or `"build:success"`.
    ///
    /// Returns `None` for an empty identifier or an unknown qualifier.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (target, condition) = match raw.rsplit_once(':') {
            Some((id, "success")) => (id, EdgeCondition::Success),
            Some((id, "failure")) => (id, EdgeCondition::Failure),
            Some(_) => return None,
            None => (raw, EdgeCondition::AnyTerminal),
        };
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        Some(Self {
            target: NodeId::new(target),
            condition,
        })
    }
}

/// A node's dependency expression, as written in the runbook file.
///
/// Expansion to a concrete edge set happens in the planner, which knows
/// declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum DependsOn {
    /// Omitted: previous node in declaration order.
    #[default]
    Implicit,
    /// `"^"`: previous node in declaration order.
    Previous,
    /// `"*"`: all nodes declared before this one.
    AllPrevious,
    /// Explicit references.
    Explicit { refs: Vec<DependencyRef> },
}

impl DependsOn {
    /// Builds an explicit dependency list from references.
    #[must_use]
    pub fn explicit(refs: Vec<DependencyRef>) -> Self {
        Self::Explicit { refs }
    }

    /// Parses a single-string form: `"^"`, `"*"`, or one identifier.
    ///
    /// Returns `None` when the identifier (or its qualifier) is malformed.
    #[must_use]
    pub fn parse_single(raw: &str) -> Option<Self> {
        match raw.trim() {
            "^" => Some(Self::Previous),
            "*" => Some(Self::AllPrevious),
            other => DependencyRef::parse(other).map(|r| Self::Explicit { refs: vec![r] }),
        }
    }
}
