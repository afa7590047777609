//! Parameter schemas and validated tool configuration.
//!
//! A [`ToolSchema`] declares every parameter a tool accepts. Validation
//! merges the schema defaults with caller overrides and checks the whole
//! map in one pass, collecting every offending key into a single
//! [`ConfigError`] instead of stopping at the first.

use super::value::{ParamType, ParamValue};
use crate::errors::{ConfigError, ConfigIssue};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied overrides, keyed by parameter name.
pub type Overrides = BTreeMap<String, ParamValue>;

/// Key for the overall monitoring budget.
pub const TIMEOUT_SECONDS: &str = "timeout_seconds";
/// Key for the status poll interval.
pub const CHECK_INTERVAL_SECONDS: &str = "check_interval_seconds";
/// Key for the readiness wait after launch.
pub const STARTUP_TIMEOUT_SECONDS: &str = "startup_timeout_seconds";
/// Key for the graceful-stop window before a forced kill.
pub const STOP_TIMEOUT_SECONDS: &str = "stop_timeout_seconds";
/// Key for the installer/uninstaller time budget.
pub const INSTALL_TIMEOUT_SECONDS: &str = "install_timeout_seconds";

/// Value restriction beyond the declared type.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Inclusive numeric range.
    Range { min: f64, max: f64 },
    /// Regular expression a string value must match.
    Pattern(String),
}

impl Constraint {
    pub fn range(min: f64, max: f64) -> Self {
        Self::Range { min, max }
    }

    pub fn pattern(pattern: &str) -> Self {
        Self::Pattern(pattern.to_string())
    }

    fn check(&self, key: &str, value: &ParamValue) -> Option<ConfigIssue> {
        match self {
            Self::Range { min, max } => {
                let v = value.as_f64()?;
                // NaN lies in no range.
                if !(*min..=*max).contains(&v) {
                    Some(ConfigIssue::OutOfRange {
                        key: key.to_string(),
                        value: value.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    })
                } else {
                    None
                }
            }
            Self::Pattern(pattern) => {
                let ParamValue::Str(s) = value else {
                    return None;
                };
                // An uncompilable pattern matches nothing.
                let matched = Regex::new(pattern).is_ok_and(|re| re.is_match(s));
                (!matched).then(|| ConfigIssue::PatternMismatch {
                    key: key.to_string(),
                    value: s.clone(),
                    pattern: pattern.clone(),
                })
            }
        }
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub default: ParamValue,
    pub constraint: Option<Constraint>,
    pub description: &'static str,
}

/// Every parameter a tool accepts.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    tool: String,
    params: BTreeMap<String, ParamSpec>,
}

impl ToolSchema {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            params: BTreeMap::new(),
        }
    }

    /// Declare a parameter. The default must satisfy its own type.
    #[must_use]
    pub fn param(
        mut self,
        name: &str,
        ty: ParamType,
        default: impl Into<ParamValue>,
        constraint: Option<Constraint>,
        description: &'static str,
    ) -> Self {
        self.params.insert(
            name.to_string(),
            ParamSpec {
                name: name.to_string(),
                ty,
                default: default.into(),
                constraint,
                description,
            },
        );
        self
    }

    /// Add the execution-control parameters every controller reads.
    #[must_use]
    pub fn with_control_params(self) -> Self {
        self.with_control_defaults(3600, 2.0)
    }

    /// Same as [`with_control_params`](Self::with_control_params) with
    /// tool-specific defaults for the budget and poll interval.
    #[must_use]
    pub fn with_control_defaults(self, timeout_secs: i64, interval_secs: f64) -> Self {
        self.param(
            TIMEOUT_SECONDS,
            ParamType::Int,
            timeout_secs,
            Some(Constraint::range(1.0, 691_200.0)),
            "overall monitoring budget",
        )
        .param(
            CHECK_INTERVAL_SECONDS,
            ParamType::Float,
            interval_secs,
            Some(Constraint::range(0.01, 60.0)),
            "status poll interval",
        )
        .param(
            STARTUP_TIMEOUT_SECONDS,
            ParamType::Float,
            30.0,
            Some(Constraint::range(0.0, 600.0)),
            "wait for the status source to become ready",
        )
        .param(
            STOP_TIMEOUT_SECONDS,
            ParamType::Float,
            10.0,
            Some(Constraint::range(0.0, 300.0)),
            "graceful stop window before a forced kill",
        )
        .param(
            INSTALL_TIMEOUT_SECONDS,
            ParamType::Int,
            300,
            Some(Constraint::range(1.0, 3600.0)),
            "installer and uninstaller time budget",
        )
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn params(&self) -> impl Iterator<Item = &ParamSpec> {
        self.params.values()
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    /// Configuration made only of declared defaults.
    pub fn defaults(&self) -> ToolConfig {
        ToolConfig {
            schema: Arc::new(self.clone()),
            values: self
                .params
                .iter()
                .map(|(k, p)| (k.clone(), p.default.clone()))
                .collect(),
        }
    }

    /// Merge defaults with `overrides` and validate the result.
    pub fn validate(&self, overrides: &Overrides) -> Result<ToolConfig, ConfigError> {
        self.defaults().merge(overrides)
    }

    /// Parse `key=value` pairs (typed by the schema) and validate them.
    pub fn validate_pairs<S: AsRef<str>>(&self, pairs: &[S]) -> Result<ToolConfig, ConfigError> {
        let mut issues = Vec::new();
        let mut overrides = Overrides::new();
        for raw in pairs {
            let raw = raw.as_ref();
            let Some((key, value)) = raw.split_once('=') else {
                issues.push(ConfigIssue::Malformed {
                    raw: raw.to_string(),
                    reason: "expected key=value".to_string(),
                });
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                issues.push(ConfigIssue::Malformed {
                    raw: raw.to_string(),
                    reason: "empty key".to_string(),
                });
                continue;
            }
            let parsed = match self.params.get(key) {
                Some(spec) => ParamValue::parse_as(value, spec.ty)
                    .unwrap_or_else(|| ParamValue::Str(value.trim().to_string())),
                None => ParamValue::infer(value),
            };
            overrides.insert(key.to_string(), parsed);
        }

        match self.validate(&overrides) {
            Ok(config) if issues.is_empty() => Ok(config),
            Ok(_) => Err(ConfigError::new(&self.tool, issues)),
            Err(mut err) => {
                issues.append(&mut err.issues);
                Err(ConfigError::new(&self.tool, issues))
            }
        }
    }

    /// Validate overrides given as a JSON object.
    pub fn validate_json(&self, value: &serde_json::Value) -> Result<ToolConfig, ConfigError> {
        let Some(object) = value.as_object() else {
            return Err(ConfigError::new(
                &self.tool,
                vec![ConfigIssue::Malformed {
                    raw: value.to_string(),
                    reason: "expected a JSON object".to_string(),
                }],
            ));
        };

        let mut issues = Vec::new();
        let mut overrides = Overrides::new();
        for (key, v) in object {
            match ParamValue::from_json(v) {
                Some(pv) => {
                    overrides.insert(key.clone(), pv);
                }
                None => issues.push(ConfigIssue::TypeMismatch {
                    key: key.clone(),
                    expected: self
                        .params
                        .get(key)
                        .map_or_else(|| "scalar".to_string(), |p| p.ty.to_string()),
                    got: json_kind(v).to_string(),
                }),
            }
        }

        match self.validate(&overrides) {
            Ok(config) if issues.is_empty() => Ok(config),
            Ok(_) => Err(ConfigError::new(&self.tool, issues)),
            Err(mut err) => {
                issues.append(&mut err.issues);
                Err(ConfigError::new(&self.tool, issues))
            }
        }
    }

    fn check_all(&self, values: &mut BTreeMap<String, ParamValue>) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        for (key, value) in values.iter_mut() {
            let Some(spec) = self.params.get(key) else {
                issues.push(ConfigIssue::UnknownKey { key: key.clone() });
                continue;
            };
            match value.coerce(spec.ty) {
                Some(coerced) => *value = coerced,
                None => {
                    issues.push(ConfigIssue::TypeMismatch {
                        key: key.clone(),
                        expected: spec.ty.to_string(),
                        got: format!("{} '{}'", value.type_of(), value),
                    });
                    continue;
                }
            }
            if let Some(issue) = spec.constraint.as_ref().and_then(|c| c.check(key, value)) {
                issues.push(issue);
            }
        }
        issues
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A validated, immutable tool configuration.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    schema: Arc<ToolSchema>,
    values: BTreeMap<String, ParamValue>,
}

impl ToolConfig {
    /// Produce a new configuration with `overrides` applied. `self` is
    /// left untouched whether or not validation succeeds.
    pub fn merge(&self, overrides: &Overrides) -> Result<ToolConfig, ConfigError> {
        let mut values = self.values.clone();
        for (k, v) in overrides {
            values.insert(k.clone(), v.clone());
        }
        let issues = self.schema.check_all(&mut values);
        if !issues.is_empty() {
            return Err(ConfigError::new(self.schema.tool(), issues));
        }
        Ok(ToolConfig {
            schema: Arc::clone(&self.schema),
            values,
        })
    }

    pub fn tool(&self) -> &str {
        self.schema.tool()
    }

    pub fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.values.get(key)?.as_f64()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric parameter read as a number of seconds.
    pub fn get_duration_secs(&self, key: &str) -> Option<Duration> {
        Duration::try_from_secs_f64(self.get_float(key)?).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                    )
                })
                .collect(),
        )
    }
}

impl PartialEq for ToolConfig {
    fn eq(&self, other: &Self) -> bool {
        self.schema.tool() == other.schema.tool() && self.values == other.values
    }
}
