//! Status vocabulary for runs, nodes, and operator decisions.
//!
//! These enums are shared between the engine state machine and the store
//! columns; `as_str`/`parse` pairs define the persisted spelling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is executing (or was interrupted without cleanup).
    Running,
    /// All reached nodes finished acceptably.
    Ok,
    /// A critical node failed.
    Nok,
    /// The operator aborted, or the run was cancelled.
    Aborted,
}

impl RunStatus {
    /// Returns the persisted spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Nok => "nok",
            Self::Aborted => "aborted",
        }
    }

    /// Parses the persisted spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "ok" => Some(Self::Ok),
            "nok" => Some(Self::Nok),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Exit code of the process for a run that finished with this status.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Nok | Self::Running => 1,
            Self::Aborted => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted status of a node attempt.
///
/// The max-attempt row is authoritative for a node's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Attempt opened but not finished (crash marker).
    Pending,
    /// Finished successfully.
    Ok,
    /// Finished with a failure.
    Nok,
    /// Skipped (conditional gate, author request, or operator skip).
    Skipped,
}

impl NodeStatus {
    /// Returns the persisted spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Nok => "nok",
            Self::Skipped => "skipped",
        }
    }

    /// Parses the persisted spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ok" => Some(Self::Ok),
            "nok" => Some(Self::Nok),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operator decision recorded on a node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Manual gate answered ok.
    Ok,
    /// Manual gate answered nok.
    Nok,
    /// Retry after a failure.
    Retry,
    /// Skip after a failure (or author-requested skip).
    Skip,
    /// Abort the run.
    Abort,
    /// No operator involvement.
    #[default]
    None,
}

impl Decision {
    /// Returns the persisted spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Nok => "nok",
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Abort => "abort",
            Self::None => "none",
        }
    }

    /// Parses the persisted spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "nok" => Some(Self::Nok),
            "retry" => Some(Self::Retry),
            "skip" => Some(Self::Skip),
            "abort" => Some(Self::Abort),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// A fresh run.
    Run,
    /// Continuation of an aborted run.
    Resume,
}

impl TriggerKind {
    /// Returns the persisted spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Resume => "resume",
        }
    }

    /// Parses the persisted spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(Self::Run),
            "resume" => Some(Self::Resume),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
