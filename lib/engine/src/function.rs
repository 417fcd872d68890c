//! Function node runner and the plugin contract.
//!
//! Plugins are a closed enumeration registered at startup. Each declares
//! its callable functions with a parameter schema; the runner validates and
//! type-coerces rendered parameters against the schema before dispatching.
//! A plugin failure of any kind is captured as a NOK outcome.

use crate::runner::{Outcome, RenderedAction, RunContext, Runner};
use async_trait::async_trait;
use opsrun_core::{VarType, VarValue};
use opsrun_runbook::NodeDescriptor;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Declaration of one plugin function parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    /// Declared type; rendered strings are coerced against it.
    pub var_type: Option<VarType>,
    pub required: bool,
}

impl ParamSpec {
    /// A required parameter with a declared type.
    #[must_use]
    pub fn required(name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            name: name.into(),
            var_type: Some(var_type),
            required: true,
        }
    }

    /// An optional parameter with a declared type.
    #[must_use]
    pub fn optional(name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            name: name.into(),
            var_type: Some(var_type),
            required: false,
        }
    }
}

/// Declared signature of one plugin function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl FunctionSignature {
    /// Creates a signature.
    #[must_use]
    pub fn new(name: impl Into<String>, params: Vec<ParamSpec>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Errors surfaced by plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The function is not part of this plugin.
    UnknownFunction { plugin: String, function: String },
    /// Parameters do not match the declared schema.
    InvalidParams { message: String },
    /// The plugin function failed.
    Failed { message: String },
}

impl fmt::Display for PluginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction { plugin, function } => {
                write!(f, "plugin '{plugin}' has no function '{function}'")
            }
            Self::InvalidParams { message } => write!(f, "invalid parameters: {message}"),
            Self::Failed { message } => write!(f, "plugin failed: {message}"),
        }
    }
}

impl std::error::Error for PluginError {}

/// A provider of named functions callable from function nodes.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The plugin name used in runbook files.
    fn name(&self) -> &str;

    /// Returns the declared signature of a function, if it exists.
    fn signature(&self, function: &str) -> Option<&FunctionSignature>;

    /// Executes a function with typed parameters and merged configuration.
    async fn execute(
        &self,
        function: &str,
        params: BTreeMap<String, VarValue>,
        config: BTreeMap<String, VarValue>,
    ) -> Result<VarValue, PluginError>;
}

/// Lookup of registered plugins.
pub trait PluginRegistry: Send + Sync {
    /// Returns the plugin registered under `name`, if any.
    fn lookup(&self, name: &str) -> Option<Arc<dyn Plugin>>;
}

/// A registry populated once at startup.
#[derive(Default)]
pub struct StaticRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl StaticRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its own name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }
}

impl PluginRegistry for StaticRegistry {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }
}

/// Runner for function nodes.
pub struct FunctionRunner {
    registry: Arc<dyn PluginRegistry>,
}

impl FunctionRunner {
    /// Creates a function runner over a plugin registry.
    #[must_use]
    pub fn new(registry: Arc<dyn PluginRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Runner for FunctionRunner {
    async fn run(
        &self,
        ctx: &RunContext,
        _node: &NodeDescriptor,
        action: &RenderedAction,
    ) -> Outcome {
        let RenderedAction::Function {
            plugin,
            function,
            params,
            config,
        } = action
        else {
            return Outcome::nok("function runner invoked for a non-function node");
        };

        let Some(provider) = self.registry.lookup(plugin) else {
            return Outcome::nok(format!("plugin_failed: unknown plugin '{plugin}'"));
        };
        let Some(signature) = provider.signature(function) else {
            return Outcome::nok(format!(
                "plugin_failed: {}",
                PluginError::UnknownFunction {
                    plugin: plugin.clone(),
                    function: function.clone(),
                }
            ));
        };

        let typed = match coerce_params(signature, params) {
            Ok(typed) => typed,
            Err(message) => return Outcome::nok(format!("plugin_failed: {message}")),
        };

        let call = provider.execute(function, typed, config.clone());
        let timeout = async {
            match ctx.timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            result = call => result,
            () = ctx.cancel.cancelled() => return Outcome::nok("cancelled"),
            () = timeout => return Outcome::nok("timeout"),
        };

        match result {
            Ok(value) => Outcome::ok().with_result_text(value.to_string()),
            Err(e) => Outcome::nok(format!("plugin_failed: {e}")),
        }
    }
}

/// Validates rendered parameters against the declared schema and coerces
/// them to their declared types.
fn coerce_params(
    signature: &FunctionSignature,
    params: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, VarValue>, String> {
    for name in params.keys() {
        if !signature.params.iter().any(|p| &p.name == name) {
            return Err(format!(
                "unexpected parameter '{name}' for function '{}'",
                signature.name
            ));
        }
    }

    let mut typed = BTreeMap::new();
    for spec in &signature.params {
        match params.get(&spec.name) {
            Some(raw) => {
                let value = match spec.var_type {
                    Some(ty) => ty.coerce(raw).map_err(|e| e.to_string())?,
                    None => VarValue::Str(raw.clone()),
                };
                typed.insert(spec.name.clone(), value);
            }
            None if spec.required => {
                return Err(format!(
                    "missing required parameter '{}' for function '{}'",
                    spec.name, signature.name
                ));
            }
            None => {}
        }
    }
    Ok(typed)
}

/// Built-in plugin with small general-purpose functions.
///
/// Registered by the CLI so runbooks work without external plugins:
/// - `echo(message: string)` — returns the message
/// - `sleep(seconds: float)` — waits, then returns the duration
pub struct BuiltinPlugin {
    signatures: Vec<FunctionSignature>,
}

impl BuiltinPlugin {
    /// Creates the builtin plugin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signatures: vec![
                FunctionSignature::new(
                    "echo",
                    vec![ParamSpec::required("message", VarType::String)],
                ),
                FunctionSignature::new(
                    "sleep",
                    vec![ParamSpec::required("seconds", VarType::Float)],
                ),
            ],
        }
    }
}

impl Default for BuiltinPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        "builtin"
    }

    fn signature(&self, function: &str) -> Option<&FunctionSignature> {
        self.signatures.iter().find(|s| s.name == function)
    }

    async fn execute(
        &self,
        function: &str,
        params: BTreeMap<String, VarValue>,
        _config: BTreeMap<String, VarValue>,
    ) -> Result<VarValue, PluginError> {
        match function {
            "echo" => Ok(params
                .get("message")
                .cloned()
                .unwrap_or(VarValue::Str(String::new()))),
            "sleep" => {
                let seconds = params.get("seconds").and_then(VarValue::as_f64).unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                Ok(VarValue::Float(seconds))
            }
            other => Err(PluginError::UnknownFunction {
                plugin: "builtin".to_string(),
                function: other.to_string(),
            }),
        }
    }
}
