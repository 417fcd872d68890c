//! Runbook file reading.
//!
//! The file surface is TOML:
//!
//! ```toml
//! [runbook]
//! title = "Release"
//! version = "1.0"
//! created_at = "2026-01-01T00:00:00Z"
//!
//! [variables.ENV]
//! default = "dev"
//! choices = ["dev", "staging", "prod"]
//!
//! [build]
//! command = "make build"
//!
//! [deploy]
//! command = "deploy.sh {{ENV}}"
//! depends_on = "build:success"
//! critical = true
//! ```
//!
//! Every top-level key other than `runbook` and `variables` is a node.
//! Node section order is preserved; implicit and `^`/`*` dependencies refer
//! to it.

use crate::definition::{Runbook, RunbookMeta};
use crate::depends::{DependencyRef, DependsOn};
use crate::error::ParseError;
use crate::node::{NodeAction, NodeDescriptor, NodeId};
use crate::variable::VariableSpec;
use chrono::{DateTime, Utc};
use opsrun_core::{VarType, VarValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use toml::Value;
use toml::value::Table;

/// Computes the hex-encoded SHA-256 digest of runbook source bytes.
#[must_use]
pub fn runbook_digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    hash.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Loads a runbook from a file.
///
/// The workflow name is the file stem.
///
/// # Errors
///
/// Returns a `ParseError` when the file cannot be read or does not describe
/// a well-formed runbook.
pub fn load_runbook(path: &Path) -> Result<Runbook, ParseError> {
    let source = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "runbook".to_string());
    parse_runbook(&name, &source)
}

/// Parses runbook source.
///
/// # Errors
///
/// Returns a `ParseError` when the source is not valid TOML or does not
/// describe a well-formed runbook.
pub fn parse_runbook(name: &str, source: &str) -> Result<Runbook, ParseError> {
    let root: Table = toml::from_str(source).map_err(|e| ParseError::Toml {
        path: name.to_string(),
        message: e.to_string(),
    })?;

    let meta_table = match root.get("runbook") {
        Some(Value::Table(t)) => t,
        _ => {
            return Err(ParseError::MissingSection {
                section: "runbook".to_string(),
            });
        }
    };
    let (meta, plugin_config) = parse_meta(meta_table)?;

    let variables = match root.get("variables") {
        Some(Value::Table(t)) => parse_variables(t)?,
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "variables".to_string(),
                reason: "expected a table".to_string(),
            });
        }
        None => Vec::new(),
    };

    let mut nodes = Vec::new();
    for (key, value) in &root {
        if key == "runbook" || key == "variables" {
            continue;
        }
        let Value::Table(table) = value else {
            return Err(ParseError::InvalidField {
                field: key.clone(),
                reason: "node sections must be tables".to_string(),
            });
        };
        nodes.push(parse_node(key, table)?);
    }

    Ok(Runbook {
        name: name.to_string(),
        meta,
        variables,
        nodes,
        plugin_config,
        digest: runbook_digest(source.as_bytes()),
    })
}

/// Loads a variables file: a flat TOML table of `name = value` pairs.
///
/// # Errors
///
/// Returns a `ParseError` when the file cannot be read or is not a flat
/// TOML table.
pub fn load_variables_file(path: &Path) -> Result<BTreeMap<String, VarValue>, ParseError> {
    let source = std::fs::read_to_string(path).map_err(|e| ParseError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let table: Table = toml::from_str(&source).map_err(|e| ParseError::Toml {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(table
        .into_iter()
        .map(|(name, value)| (name, var_value_from_toml(value)))
        .collect())
}

fn parse_meta(table: &Table) -> Result<(RunbookMeta, PluginConfigMap), ParseError> {
    let title = require_str(table, "runbook", "title")?;
    let version = require_str(table, "runbook", "version")?;
    let created_at = parse_created_at(table)?;

    let plugin_config = match table.get("plugin_config") {
        Some(Value::Table(plugins)) => {
            let mut config = BTreeMap::new();
            for (plugin, value) in plugins {
                let Value::Table(entries) = value else {
                    return Err(ParseError::InvalidField {
                        field: format!("runbook.plugin_config.{plugin}"),
                        reason: "expected a table".to_string(),
                    });
                };
                config.insert(
                    plugin.clone(),
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), var_value_from_toml(v.clone())))
                        .collect(),
                );
            }
            config
        }
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "runbook.plugin_config".to_string(),
                reason: "expected a table".to_string(),
            });
        }
        None => BTreeMap::new(),
    };

    Ok((
        RunbookMeta {
            title,
            description: optional_str(table, "runbook", "description")?,
            version,
            author: optional_str(table, "runbook", "author")?,
            created_at,
        },
        plugin_config,
    ))
}

type PluginConfigMap = BTreeMap<String, BTreeMap<String, VarValue>>;

fn parse_created_at(table: &Table) -> Result<DateTime<Utc>, ParseError> {
    let raw = match table.get("created_at") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Datetime(dt)) => dt.to_string(),
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "runbook.created_at".to_string(),
                reason: "expected an RFC 3339 timestamp".to_string(),
            });
        }
        None => {
            return Err(ParseError::MissingSection {
                section: "runbook.created_at".to_string(),
            });
        }
    };
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| ParseError::InvalidTimestamp { value: raw })
}

fn parse_variables(table: &Table) -> Result<Vec<VariableSpec>, ParseError> {
    let mut specs = Vec::new();
    for (name, value) in table {
        let spec = match value {
            Value::Table(entries) => parse_variable_spec(name, entries)?,
            // Shorthand: `ENV = "dev"` declares a variable with a default.
            other => VariableSpec::new(name).with_default(var_value_from_toml(other.clone())),
        };
        specs.push(spec);
    }
    Ok(specs)
}

fn parse_variable_spec(name: &str, table: &Table) -> Result<VariableSpec, ParseError> {
    let mut spec = VariableSpec::new(name);
    spec.default = table.get("default").cloned().map(var_value_from_toml);
    spec.required = optional_bool(table, name, "required")?.unwrap_or(false);
    spec.description = optional_str(table, name, "description")?;

    if let Some(value) = table.get("choices") {
        let Value::Array(items) = value else {
            return Err(ParseError::InvalidField {
                field: format!("variables.{name}.choices"),
                reason: "expected an array".to_string(),
            });
        };
        spec.choices = Some(items.iter().cloned().map(var_value_from_toml).collect());
    }

    if let Some(value) = table.get("type") {
        let Value::String(type_name) = value else {
            return Err(ParseError::InvalidField {
                field: format!("variables.{name}.type"),
                reason: "expected a type name".to_string(),
            });
        };
        spec.var_type = Some(VarType::parse(type_name).ok_or_else(|| ParseError::UnknownType {
            variable: name.to_string(),
            type_name: type_name.clone(),
        })?);
    }

    spec.min = optional_number(table, name, "min")?;
    spec.max = optional_number(table, name, "max")?;
    Ok(spec)
}

fn parse_node(id: &str, table: &Table) -> Result<NodeDescriptor, ParseError> {
    let action = parse_action(id, table)?;

    let depends_on = match table.get("depends_on") {
        None => DependsOn::Implicit,
        Some(Value::String(raw)) => {
            DependsOn::parse_single(raw).ok_or_else(|| ParseError::InvalidField {
                field: format!("{id}.depends_on"),
                reason: format!("malformed dependency '{raw}'"),
            })?
        }
        Some(Value::Array(items)) => {
            let mut refs = Vec::with_capacity(items.len());
            for item in items {
                let Value::String(raw) = item else {
                    return Err(ParseError::InvalidField {
                        field: format!("{id}.depends_on"),
                        reason: "array entries must be strings".to_string(),
                    });
                };
                refs.push(DependencyRef::parse(raw).ok_or_else(|| {
                    ParseError::InvalidField {
                        field: format!("{id}.depends_on"),
                        reason: format!("malformed dependency '{raw}'"),
                    }
                })?);
            }
            DependsOn::explicit(refs)
        }
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: format!("{id}.depends_on"),
                reason: "expected a string or an array of strings".to_string(),
            });
        }
    };

    let timeout_secs = match table.get("timeout") {
        None => None,
        Some(Value::Integer(secs)) if *secs >= 0 => Some(*secs as u64),
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: format!("{id}.timeout"),
                reason: "expected a non-negative integer number of seconds".to_string(),
            });
        }
    };

    Ok(NodeDescriptor {
        id: NodeId::new(id),
        action,
        depends_on,
        critical: optional_bool(table, id, "critical")?.unwrap_or(false),
        skip: optional_bool(table, id, "skip")?.unwrap_or(false),
        timeout_secs,
        when: optional_str(table, id, "when")?,
        description: optional_str(table, id, "description")?,
    })
}

fn parse_action(id: &str, table: &Table) -> Result<NodeAction, ParseError> {
    let discriminators = ["prompt", "command", "function"]
        .into_iter()
        .filter(|key| table.contains_key(*key))
        .count();
    if discriminators != 1 {
        return Err(ParseError::AmbiguousKind {
            node: id.to_string(),
        });
    }

    if table.contains_key("prompt") {
        return Ok(NodeAction::Manual {
            prompt: require_str(table, id, "prompt")?,
        });
    }

    if table.contains_key("command") {
        return Ok(NodeAction::Command {
            command: require_str(table, id, "command")?,
            interactive: optional_bool(table, id, "interactive")?.unwrap_or(false),
        });
    }

    let function = require_str(table, id, "function")?;
    let plugin = match table.get("plugin") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(ParseError::MissingField {
                node: id.to_string(),
                field: "plugin",
            });
        }
    };

    let params = match table.get("params") {
        None => BTreeMap::new(),
        Some(Value::Table(entries)) => entries
            .iter()
            .map(|(k, v)| {
                let raw = match v {
                    Value::String(s) => s.clone(),
                    other => var_value_from_toml(other.clone()).to_string(),
                };
                (k.clone(), raw)
            })
            .collect(),
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: format!("{id}.params"),
                reason: "expected a table".to_string(),
            });
        }
    };

    let plugin_config = match table.get("plugin_config") {
        None => BTreeMap::new(),
        Some(Value::Table(entries)) => entries
            .iter()
            .map(|(k, v)| (k.clone(), var_value_from_toml(v.clone())))
            .collect(),
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: format!("{id}.plugin_config"),
                reason: "expected a table".to_string(),
            });
        }
    };

    Ok(NodeAction::Function {
        plugin,
        function,
        params,
        plugin_config,
    })
}

fn var_value_from_toml(value: Value) -> VarValue {
    match value {
        Value::String(s) => VarValue::Str(s),
        Value::Integer(i) => VarValue::Int(i),
        Value::Float(f) => VarValue::Float(f),
        Value::Boolean(b) => VarValue::Bool(b),
        Value::Datetime(dt) => VarValue::Str(dt.to_string()),
        Value::Array(items) => {
            VarValue::List(items.into_iter().map(var_value_from_toml).collect())
        }
        Value::Table(entries) => VarValue::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k, var_value_from_toml(v)))
                .collect(),
        ),
    }
}

fn require_str(table: &Table, scope: &str, key: &'static str) -> Result<String, ParseError> {
    match table.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ParseError::InvalidField {
            field: format!("{scope}.{key}"),
            reason: "expected a string".to_string(),
        }),
        None => Err(ParseError::MissingField {
            node: scope.to_string(),
            field: key,
        }),
    }
}

fn optional_str(table: &Table, scope: &str, key: &str) -> Result<Option<String>, ParseError> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParseError::InvalidField {
            field: format!("{scope}.{key}"),
            reason: "expected a string".to_string(),
        }),
    }
}

fn optional_bool(table: &Table, scope: &str, key: &str) -> Result<Option<bool>, ParseError> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::Boolean(b)) => Ok(Some(*b)),
        Some(_) => Err(ParseError::InvalidField {
            field: format!("{scope}.{key}"),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn optional_number(table: &Table, scope: &str, key: &str) -> Result<Option<f64>, ParseError> {
    match table.get(key) {
        None => Ok(None),
        Some(Value::Integer(i)) => Ok(Some(*i as f64)),
        Some(Value::Float(f)) => Ok(Some(*f)),
        Some(_) => Err(ParseError::InvalidField {
            field: format!("{scope}.{key}"),
            reason: "expected a number".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depends::EdgeCondition;
    use crate::node::NodeKind;

    const SAMPLE: &str = r##"
[runbook]
title = "Release"
description = "Ship a release"
version = "1.2"
author = "ops"
created_at = "2026-01-01T00:00:00Z"

[runbook.plugin_config.slack]
channel = "#ops"

[variables.ENV]
default = "dev"
choices = ["dev", "staging", "prod"]
required = true

[variables.REPLICAS]
type = "int"
min = 1
max = 8

[checkout]
command = "git checkout main"

[build]
command = "make build"
critical = true
timeout = 600

[approve]
prompt = "Deploy {{ENV}}?"
depends_on = "build:success"

[deploy]
command = "deploy.sh {{ENV}}"
depends_on = ["approve:success"]

[rollback]
command = "rollback.sh"
depends_on = ["build:failure"]

[notify]
plugin = "slack"
function = "post"
depends_on = "*"
params = { text = "release finished on {{ENV}}", count = 2 }
"##;

    #[test]
    fn parses_full_runbook() {
        let runbook = parse_runbook("release", SAMPLE).unwrap();

        assert_eq!(runbook.name, "release");
        assert_eq!(runbook.meta.title, "Release");
        assert_eq!(runbook.meta.version, "1.2");
        assert_eq!(runbook.meta.author.as_deref(), Some("ops"));

        assert_eq!(runbook.variables.len(), 2);
        let env = runbook.variable("ENV").unwrap();
        assert!(env.required);
        assert_eq!(env.choices.as_ref().map(Vec::len), Some(3));
        let replicas = runbook.variable("REPLICAS").unwrap();
        assert_eq!(replicas.var_type, Some(VarType::Int));
        assert_eq!(replicas.min, Some(1.0));

        // Declaration order is preserved.
        let ids: Vec<&str> = runbook.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["checkout", "build", "approve", "deploy", "rollback", "notify"]
        );

        let build = runbook.node(&NodeId::new("build")).unwrap();
        assert!(build.critical);
        assert_eq!(build.timeout_secs, Some(600));
        assert_eq!(build.kind(), NodeKind::Command);

        let approve = runbook.node(&NodeId::new("approve")).unwrap();
        assert_eq!(approve.kind(), NodeKind::Manual);
        let DependsOn::Explicit { refs } = &approve.depends_on else {
            panic!("expected explicit dependency");
        };
        assert_eq!(refs[0].condition, EdgeCondition::Success);

        let rollback = runbook.node(&NodeId::new("rollback")).unwrap();
        let DependsOn::Explicit { refs } = &rollback.depends_on else {
            panic!("expected explicit dependency");
        };
        assert_eq!(refs[0].condition, EdgeCondition::Failure);

        let notify = runbook.node(&NodeId::new("notify")).unwrap();
        assert_eq!(notify.depends_on, DependsOn::AllPrevious);
        let NodeAction::Function { params, .. } = &notify.action else {
            panic!("expected function node");
        };
        assert_eq!(params.get("count").map(String::as_str), Some("2"));

        assert_eq!(
            runbook
                .plugin_config
                .get("slack")
                .and_then(|c| c.get("channel")),
            Some(&VarValue::Str("#ops".to_string()))
        );
    }

    #[test]
    fn digest_is_stable_and_input_sensitive() {
        let a = parse_runbook("release", SAMPLE).unwrap();
        let b = parse_runbook("release", SAMPLE).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.digest.len(), 64);

        let changed = SAMPLE.replace("make build", "make all");
        let c = parse_runbook("release", &changed).unwrap();
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn missing_runbook_section_is_rejected() {
        let err = parse_runbook("x", "[build]\ncommand = \"make\"\n").unwrap_err();
        assert_eq!(err.code(), "missing_section");
    }

    #[test]
    fn node_without_payload_is_rejected() {
        let source = r#"
[runbook]
title = "T"
version = "1"
created_at = "2026-01-01T00:00:00Z"

[step]
description = "does nothing"
"#;
        let err = parse_runbook("x", source).unwrap_err();
        assert!(matches!(err, ParseError::AmbiguousKind { .. }));
    }

    #[test]
    fn function_without_plugin_is_rejected() {
        let source = r#"
[runbook]
title = "T"
version = "1"
created_at = "2026-01-01T00:00:00Z"

[step]
function = "post"
"#;
        let err = parse_runbook("x", source).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField { field: "plugin", .. }
        ));
    }

    #[test]
    fn malformed_dependency_is_rejected() {
        let source = r#"
[runbook]
title = "T"
version = "1"
created_at = "2026-01-01T00:00:00Z"

[a]
command = "true"

[b]
command = "true"
depends_on = "a:done"
"#;
        let err = parse_runbook("x", source).unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { .. }));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let source = r#"
[runbook]
title = "T"
version = "1"
created_at = "yesterday"

[a]
command = "true"
"#;
        let err = parse_runbook("x", source).unwrap_err();
        assert_eq!(err.code(), "invalid_timestamp");
    }

    #[test]
    fn toml_datetime_created_at_is_accepted() {
        let source = r#"
[runbook]
title = "T"
version = "1"
created_at = 2026-01-01T00:00:00Z

[a]
command = "true"
"#;
        let runbook = parse_runbook("x", source).unwrap();
        assert_eq!(runbook.meta.created_at.timezone(), Utc);
    }

    #[test]
    fn variables_shorthand_becomes_default() {
        let source = r#"
[runbook]
title = "T"
version = "1"
created_at = "2026-01-01T00:00:00Z"

[variables]
ENV = "dev"

[a]
command = "true"
"#;
        let runbook = parse_runbook("x", source).unwrap();
        let env = runbook.variable("ENV").unwrap();
        assert_eq!(env.default, Some(VarValue::Str("dev".to_string())));
        assert!(!env.required);
    }
}
