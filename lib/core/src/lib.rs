//! Core domain types for the opsrun runbook executor.
//!
//! This crate provides the typed variable value model shared by the runbook
//! surface, the variable resolver, the templater, and the plugin parameter
//! machinery.

pub mod value;

pub use value::{CoerceError, VarType, VarValue};
