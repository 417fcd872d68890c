//! Variable resolution.
//!
//! Sources are merged in strict precedence, highest first:
//!
//! 1. explicit key/value overrides (CLI `-v`)
//! 2. entries from a variables file
//! 3. environment values under a configured prefix
//! 4. interactive prompt for missing required specs
//! 5. spec defaults
//!
//! The output is frozen before the engine starts; the engine never
//! re-resolves variables mid-run.

use async_trait::async_trait;
use opsrun_core::{VarType, VarValue};
use opsrun_runbook::VariableSpec;
use std::collections::BTreeMap;
use std::fmt;

/// The frozen variable snapshot handed to all template rendering.
pub type ResolvedVariables = BTreeMap<String, VarValue>;

/// Raw variable inputs, one map per precedence layer.
#[derive(Debug, Clone, Default)]
pub struct VariableSources {
    /// Explicit overrides (highest precedence), as raw strings.
    pub overrides: BTreeMap<String, String>,
    /// Values from a variables file, already typed.
    pub file_values: BTreeMap<String, VarValue>,
    /// Values scraped from the environment, as raw strings.
    pub env_values: BTreeMap<String, String>,
}

impl VariableSources {
    /// Looks up an environment value by declared name.
    ///
    /// Environment variable names are conventionally upper-case, so the
    /// match is case-insensitive; an exact-case entry wins.
    fn env_value(&self, name: &str) -> Option<&String> {
        self.env_values.get(name).or_else(|| {
            self.env_values
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }
}

/// Port for interactively prompting missing required variables.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Asks the operator for a value; `None` means no input was given.
    async fn prompt(&self, spec: &VariableSpec) -> Option<String>;
}

/// A prompter that never answers; used in non-interactive mode.
pub struct NoPrompter;

#[async_trait]
impl Prompter for NoPrompter {
    async fn prompt(&self, _spec: &VariableSpec) -> Option<String> {
        None
    }
}

/// Errors from variable resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableError {
    /// A required variable has no value from any source.
    MissingRequired { name: String },
    /// The value is not in the declared choice set.
    BadChoice {
        name: String,
        value: String,
        choices: Vec<String>,
    },
    /// A string input could not be coerced to the declared type.
    CoercionFailed {
        name: String,
        value: String,
        expected: VarType,
    },
    /// A numeric value violates the declared min/max bounds.
    OutOfRange {
        name: String,
        value: String,
        min: Option<f64>,
        max: Option<f64>,
    },
}

impl VariableError {
    /// Stable machine code for the CLI surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingRequired { .. } => "missing_required",
            Self::BadChoice { .. } => "bad_choice",
            Self::CoercionFailed { .. } => "coercion_failed",
            Self::OutOfRange { .. } => "out_of_range",
        }
    }
}

impl fmt::Display for VariableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingRequired { name } => {
                write!(f, "required variable '{name}' has no value")
            }
            Self::BadChoice {
                name,
                value,
                choices,
            } => write!(
                f,
                "variable '{name}': '{value}' is not one of [{}]",
                choices.join(", ")
            ),
            Self::CoercionFailed {
                name,
                value,
                expected,
            } => write!(f, "variable '{name}': cannot coerce '{value}' to {expected}"),
            Self::OutOfRange {
                name,
                value,
                min,
                max,
            } => {
                write!(f, "variable '{name}': {value} is out of range")?;
                if let Some(min) = min {
                    write!(f, ", min {min}")?;
                }
                if let Some(max) = max {
                    write!(f, ", max {max}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for VariableError {}

/// Merges, prompts, coerces, and validates variables against their specs.
pub struct VariableResolver<'a> {
    specs: &'a [VariableSpec],
    interactive: bool,
}

impl<'a> VariableResolver<'a> {
    /// Creates a resolver over the runbook's variable specs.
    #[must_use]
    pub fn new(specs: &'a [VariableSpec], interactive: bool) -> Self {
        Self { specs, interactive }
    }

    /// Resolves all variables.
    ///
    /// Keys supplied by overrides or the variables file that have no spec
    /// pass through untyped, so templates can reference ad-hoc values.
    ///
    /// # Errors
    ///
    /// Returns a `VariableError` on a missing required value, a bad choice,
    /// a failed coercion, or a range violation.
    pub async fn resolve(
        &self,
        sources: &VariableSources,
        prompter: &dyn Prompter,
    ) -> Result<ResolvedVariables, VariableError> {
        let mut resolved = ResolvedVariables::new();

        for spec in self.specs {
            let value = self.resolve_one(spec, sources, prompter).await?;
            if let Some(value) = value {
                resolved.insert(spec.name.clone(), value);
            }
        }

        // Pass through undeclared keys, lowest layer first so higher layers win.
        for (name, value) in &sources.env_values {
            if !resolved.contains_key(name) && self.spec_ci(name).is_none() {
                resolved.insert(name.clone(), VarValue::Str(value.clone()));
            }
        }
        for (name, value) in &sources.file_values {
            if !self.has_spec(name) {
                resolved.insert(name.clone(), value.clone());
            }
        }
        for (name, value) in &sources.overrides {
            if !self.has_spec(name) {
                resolved.insert(name.clone(), VarValue::Str(value.clone()));
            }
        }

        Ok(resolved)
    }

    /// Overlays the supplied source layers onto an existing snapshot.
    ///
    /// Used on resume: the base is the run's persisted snapshot, and only
    /// the layers the caller actually supplied are applied, in the same
    /// precedence order as a fresh run. Defaults and prompts do not apply.
    ///
    /// # Errors
    ///
    /// Returns a `VariableError` on a failed coercion, a bad choice, or a
    /// range violation in a supplied layer.
    pub fn overlay(
        &self,
        mut base: ResolvedVariables,
        sources: &VariableSources,
    ) -> Result<ResolvedVariables, VariableError> {
        // Ascending precedence so later layers win. Environment entries
        // land under the declared spelling when a spec matches their name
        // case-insensitively.
        for (name, raw) in &sources.env_values {
            let canonical = self
                .spec_ci(name)
                .map_or_else(|| name.clone(), |spec| spec.name.clone());
            base.insert(canonical.clone(), self.layer_value_raw(&canonical, raw)?);
        }
        for (name, value) in &sources.file_values {
            base.insert(name.clone(), self.layer_value_typed(name, value.clone())?);
        }
        for (name, raw) in &sources.overrides {
            base.insert(name.clone(), self.layer_value_raw(name, raw)?);
        }
        Ok(base)
    }

    fn layer_value_raw(&self, name: &str, raw: &str) -> Result<VarValue, VariableError> {
        match self.spec(name) {
            Some(spec) => {
                let value = coerce_raw(spec, raw)?;
                validate(spec, &value)?;
                Ok(value)
            }
            None => Ok(VarValue::Str(raw.to_string())),
        }
    }

    fn layer_value_typed(&self, name: &str, value: VarValue) -> Result<VarValue, VariableError> {
        match self.spec(name) {
            Some(spec) => {
                let value = coerce_typed(spec, value)?;
                validate(spec, &value)?;
                Ok(value)
            }
            None => Ok(value),
        }
    }

    fn spec(&self, name: &str) -> Option<&VariableSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Case-insensitive spec lookup; an exact-case match wins.
    fn spec_ci(&self, name: &str) -> Option<&VariableSpec> {
        self.spec(name)
            .or_else(|| self.specs.iter().find(|s| s.name.eq_ignore_ascii_case(name)))
    }

    fn has_spec(&self, name: &str) -> bool {
        self.spec(name).is_some()
    }

    async fn resolve_one(
        &self,
        spec: &VariableSpec,
        sources: &VariableSources,
        prompter: &dyn Prompter,
    ) -> Result<Option<VarValue>, VariableError> {
        let mut value = if let Some(raw) = sources.overrides.get(&spec.name) {
            Some(coerce_raw(spec, raw)?)
        } else if let Some(typed) = sources.file_values.get(&spec.name) {
            Some(coerce_typed(spec, typed.clone())?)
        } else if let Some(raw) = sources.env_value(&spec.name) {
            Some(coerce_raw(spec, raw)?)
        } else {
            None
        };

        if value.is_none() && spec.required && self.interactive {
            if let Some(raw) = prompter.prompt(spec).await {
                value = Some(coerce_raw(spec, &raw)?);
            }
        }

        if value.is_none() {
            value = spec
                .default
                .as_ref()
                .map(|d| coerce_typed(spec, d.clone()))
                .transpose()?;
        }

        let Some(value) = value else {
            if spec.required {
                return Err(VariableError::MissingRequired {
                    name: spec.name.clone(),
                });
            }
            return Ok(None);
        };

        validate(spec, &value)?;
        Ok(Some(value))
    }
}

/// Coerces a raw string input against the spec's declared type.
fn coerce_raw(spec: &VariableSpec, raw: &str) -> Result<VarValue, VariableError> {
    match spec.var_type {
        Some(ty) => ty.coerce(raw).map_err(|e| VariableError::CoercionFailed {
            name: spec.name.clone(),
            value: e.value,
            expected: e.expected,
        }),
        None => Ok(VarValue::Str(raw.to_string())),
    }
}

/// Coerces an already-typed value (file entry or default) when the declared
/// type disagrees; string values are re-coerced, anything else must match.
fn coerce_typed(spec: &VariableSpec, value: VarValue) -> Result<VarValue, VariableError> {
    let Some(ty) = spec.var_type else {
        return Ok(value);
    };
    if value.type_of() == ty {
        return Ok(value);
    }
    // An int is an acceptable float.
    if ty == VarType::Float && let VarValue::Int(i) = value {
        return Ok(VarValue::Float(i as f64));
    }
    match value.as_str() {
        Some(raw) => ty
            .coerce(raw)
            .map_err(|e| VariableError::CoercionFailed {
                name: spec.name.clone(),
                value: e.value,
                expected: e.expected,
            }),
        None => Err(VariableError::CoercionFailed {
            name: spec.name.clone(),
            value: value.to_string(),
            expected: ty,
        }),
    }
}

fn validate(spec: &VariableSpec, value: &VarValue) -> Result<(), VariableError> {
    if let Some(choices) = &spec.choices {
        let matched = choices.iter().any(|choice| {
            match coerce_typed(spec, choice.clone()) {
                Ok(coerced) => &coerced == value,
                Err(_) => choice == value,
            }
        });
        if !matched {
            return Err(VariableError::BadChoice {
                name: spec.name.clone(),
                value: value.to_string(),
                choices: choices.iter().map(ToString::to_string).collect(),
            });
        }
    }

    if (spec.min.is_some() || spec.max.is_some())
        && let Some(n) = value.as_f64()
    {
        if let Some(min) = spec.min
            && n < min
        {
            return Err(VariableError::OutOfRange {
                name: spec.name.clone(),
                value: value.to_string(),
                min: spec.min,
                max: spec.max,
            });
        }
        if let Some(max) = spec.max
            && n > max
        {
            return Err(VariableError::OutOfRange {
                name: spec.name.clone(),
                value: value.to_string(),
                min: spec.min,
                max: spec.max,
            });
        }
    }

    Ok(())
}

/// Scrapes variable values from the process environment.
///
/// `PREFIX_NAME=value` becomes `NAME=value`.
#[must_use]
pub fn scrape_env(prefix: &str) -> BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .filter(|rest| !rest.is_empty())
                .map(|rest| (rest.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A prompter that replays scripted answers.
    struct ScriptedPrompter {
        answers: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedPrompter {
        fn new(answers: Vec<Option<String>>) -> Self {
            Self {
                answers: Mutex::new(answers),
            }
        }
    }

    #[async_trait]
    impl Prompter for ScriptedPrompter {
        async fn prompt(&self, _spec: &VariableSpec) -> Option<String> {
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                None
            } else {
                answers.remove(0)
            }
        }
    }

    fn env_spec() -> VariableSpec {
        VariableSpec::new("ENV")
            .with_default(VarValue::Str("dev".to_string()))
            .with_choices(vec![
                VarValue::Str("dev".to_string()),
                VarValue::Str("staging".to_string()),
                VarValue::Str("prod".to_string()),
            ])
    }

    #[tokio::test]
    async fn precedence_override_beats_file_beats_env_beats_default() {
        let specs = vec![env_spec()];
        let resolver = VariableResolver::new(&specs, false);

        let mut sources = VariableSources::default();
        sources
            .env_values
            .insert("ENV".to_string(), "staging".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("ENV"), Some(&VarValue::Str("staging".to_string())));

        sources
            .file_values
            .insert("ENV".to_string(), VarValue::Str("staging".to_string()));
        sources
            .overrides
            .insert("ENV".to_string(), "prod".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("ENV"), Some(&VarValue::Str("prod".to_string())));

        let vars = resolver
            .resolve(&VariableSources::default(), &NoPrompter)
            .await
            .unwrap();
        assert_eq!(vars.get("ENV"), Some(&VarValue::Str("dev".to_string())));
    }

    #[tokio::test]
    async fn missing_required_without_prompt_errors() {
        let specs = vec![VariableSpec::new("TICKET").required()];
        let resolver = VariableResolver::new(&specs, false);
        let err = resolver
            .resolve(&VariableSources::default(), &NoPrompter)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "missing_required");
    }

    #[tokio::test]
    async fn interactive_prompt_fills_required() {
        let specs = vec![VariableSpec::new("TICKET").required()];
        let resolver = VariableResolver::new(&specs, true);
        let prompter = ScriptedPrompter::new(vec![Some("OPS-1".to_string())]);
        let vars = resolver
            .resolve(&VariableSources::default(), &prompter)
            .await
            .unwrap();
        assert_eq!(vars.get("TICKET"), Some(&VarValue::Str("OPS-1".to_string())));
    }

    #[tokio::test]
    async fn typed_coercion_and_bounds() {
        let specs = vec![VariableSpec::new("REPLICAS").with_type(VarType::Int)];
        let mut specs_bounded = specs.clone();
        specs_bounded[0].min = Some(1.0);
        specs_bounded[0].max = Some(8.0);

        let resolver = VariableResolver::new(&specs_bounded, false);
        let mut sources = VariableSources::default();
        sources
            .overrides
            .insert("REPLICAS".to_string(), "4".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("REPLICAS"), Some(&VarValue::Int(4)));

        sources
            .overrides
            .insert("REPLICAS".to_string(), "9".to_string());
        let err = resolver.resolve(&sources, &NoPrompter).await.unwrap_err();
        assert_eq!(err.code(), "out_of_range");

        sources
            .overrides
            .insert("REPLICAS".to_string(), "many".to_string());
        let err = resolver.resolve(&sources, &NoPrompter).await.unwrap_err();
        assert_eq!(err.code(), "coercion_failed");
    }

    #[tokio::test]
    async fn choice_set_is_enforced_after_coercion() {
        let specs = vec![
            VariableSpec::new("COUNT")
                .with_type(VarType::Int)
                .with_choices(vec![
                    VarValue::Str("1".to_string()),
                    VarValue::Str("2".to_string()),
                ]),
        ];
        let resolver = VariableResolver::new(&specs, false);

        let mut sources = VariableSources::default();
        sources.overrides.insert("COUNT".to_string(), "2".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("COUNT"), Some(&VarValue::Int(2)));

        sources.overrides.insert("COUNT".to_string(), "3".to_string());
        let err = resolver.resolve(&sources, &NoPrompter).await.unwrap_err();
        assert_eq!(err.code(), "bad_choice");
    }

    #[tokio::test]
    async fn env_layer_matches_declared_names_case_insensitively() {
        let specs = vec![env_spec()];
        let resolver = VariableResolver::new(&specs, false);

        let mut sources = VariableSources::default();
        sources
            .env_values
            .insert("env".to_string(), "staging".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("ENV"), Some(&VarValue::Str("staging".to_string())));
        // Consumed by the spec: no duplicate under the raw spelling.
        assert!(!vars.contains_key("env"));

        // An exact-case entry wins over a case-folded one.
        sources
            .env_values
            .insert("ENV".to_string(), "prod".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("ENV"), Some(&VarValue::Str("prod".to_string())));
    }

    #[test]
    fn overlay_canonicalizes_env_names() {
        let specs = vec![env_spec()];
        let resolver = VariableResolver::new(&specs, false);

        let base: ResolvedVariables =
            [("ENV".to_string(), VarValue::Str("dev".to_string()))]
                .into_iter()
                .collect();
        let mut sources = VariableSources::default();
        sources
            .env_values
            .insert("env".to_string(), "staging".to_string());

        let vars = resolver.overlay(base, &sources).unwrap();
        assert_eq!(vars.get("ENV"), Some(&VarValue::Str("staging".to_string())));
        assert!(!vars.contains_key("env"));
    }

    #[tokio::test]
    async fn undeclared_keys_pass_through() {
        let specs = vec![env_spec()];
        let resolver = VariableResolver::new(&specs, false);
        let mut sources = VariableSources::default();
        sources
            .overrides
            .insert("EXTRA".to_string(), "x".to_string());
        let vars = resolver.resolve(&sources, &NoPrompter).await.unwrap();
        assert_eq!(vars.get("EXTRA"), Some(&VarValue::Str("x".to_string())));
    }
}
