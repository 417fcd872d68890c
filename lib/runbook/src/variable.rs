//! Variable specifications.
//!
//! The `[variables]` section of a runbook declares the variables its
//! templates may reference: optional defaults, a required flag, a closed
//! choice set, a declared type, and numeric bounds.

use opsrun_core::{VarType, VarValue};
use serde::{Deserialize, Serialize};

/// Declaration of a single runbook variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// The variable name as referenced in templates.
    pub name: String,
    /// Default value used when no source supplies one.
    pub default: Option<VarValue>,
    /// Whether a value must be present after all sources are merged.
    pub required: bool,
    /// Closed set of allowed values (compared after type coercion).
    pub choices: Option<Vec<VarValue>>,
    /// Declared type; string inputs are coerced against it.
    pub var_type: Option<VarType>,
    /// Lower bound for numeric types.
    pub min: Option<f64>,
    /// Upper bound for numeric types.
    pub max: Option<f64>,
    /// Human-readable description, shown when prompting.
    pub description: Option<String>,
}

impl VariableSpec {
    /// Creates a spec with only a name; everything else defaulted.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            required: false,
            choices: None,
            var_type: None,
            min: None,
            max: None,
            description: None,
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: VarValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Marks the variable required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the declared type.
    #[must_use]
    pub fn with_type(mut self, var_type: VarType) -> Self {
        self.var_type = Some(var_type);
        self
    }

    /// Sets the choice set.
    #[must_use]
    pub fn with_choices(mut self, choices: Vec<VarValue>) -> Self {
        self.choices = Some(choices);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let spec = VariableSpec::new("ENV")
            .with_default(VarValue::Str("dev".to_string()))
            .with_choices(vec![
                VarValue::Str("dev".to_string()),
                VarValue::Str("prod".to_string()),
            ])
            .with_type(VarType::String);
        assert_eq!(spec.name, "ENV");
        assert!(!spec.required);
        assert_eq!(spec.choices.as_ref().map(Vec::len), Some(2));
    }
}
