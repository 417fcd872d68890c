//! Runbook model and file surface for opsrun.
//!
//! A runbook is a declarative description of an operational workflow:
//!
//! - **Metadata**: title, description, version, author, creation time
//! - **Variables**: typed specs with defaults, choices and ranges
//! - **Nodes**: manual gates, shell commands, and plugin function calls,
//!   wired together by dependency expressions
//!
//! This crate owns the TOML reading (declaration order of node sections is
//! semantic and preserved), the variables-file reader, and the runbook
//! digest used for resume consistency checks.

pub mod definition;
pub mod depends;
pub mod error;
pub mod node;
pub mod source;
pub mod variable;

pub use definition::{Runbook, RunbookMeta};
pub use depends::{DependencyRef, DependsOn, EdgeCondition};
pub use error::ParseError;
pub use node::{NodeAction, NodeDescriptor, NodeId, NodeKind};
pub use source::{load_runbook, load_variables_file, parse_runbook, runbook_digest};
pub use variable::VariableSpec;
