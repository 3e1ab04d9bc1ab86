//! Configuration validation.
//!
//! Checks a config document against the known schema, flags unknown or
//! misspelled fields and reports settings that would fail or misbehave at
//! endpoint startup.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
};

#[cfg(feature = "metrics")]
use conveyor_metrics::{config as config_metrics, counter, labels};

use crate::{
    duration::parse_duration,
    env_subst::substitute_env,
    schema::{ConveyorConfig, SubscriptionModeConfig},
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "semantic",
    /// "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "endpoint.concurrency"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    /// Dynamic keys (message types) with scalar values.
    Map,
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Map, Struct};

    Struct(HashMap::from([
        (
            "endpoint",
            Struct(HashMap::from([
                ("name", Leaf),
                ("instance_discriminator", Leaf),
                ("send_only", Leaf),
                ("public_return_address", Leaf),
                ("concurrency", Leaf),
            ])),
        ),
        (
            "recoverability",
            Struct(HashMap::from([
                ("immediate_retries", Leaf),
                ("delayed_retries", Leaf),
                ("time_increase", Leaf),
                ("error_queue", Leaf),
            ])),
        ),
        (
            "pipeline",
            Struct(HashMap::from([("strict_extensions", Leaf)])),
        ),
        (
            "routing",
            Struct(HashMap::from([
                ("routes", Map),
                ("publishers", Map),
                ("subscription_mode", Leaf),
            ])),
        ),
        (
            "metrics",
            Struct(HashMap::from([("enabled", Leaf), ("labels", Map)])),
        ),
    ]))
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|candidate| (*candidate, levenshtein(needle, candidate)))
        .filter(|(_, d)| *d > 0 && *d <= max_distance)
        .min_by_key(|(_, d)| *d)
        .map(|(candidate, _)| candidate)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or the discovered config file
/// if `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Info,
                "file-ref",
                "",
                "no config file found; using defaults",
            )],
            config_path: None,
        };
    };

    let mut result = match std::fs::read_to_string(&actual_path) {
        Ok(content) => {
            let format = actual_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("toml");
            validate_str(&substitute_env(&content), format)
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::new(
                Severity::Error,
                "file-ref",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: None,
        },
    };
    result.config_path = Some(actual_path);
    result
}

/// Validate a config document given as a string in `format` (`toml`,
/// `yaml`/`yml` or `json`).
#[must_use]
pub fn validate_str(content: &str, format: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let parsed: Result<serde_json::Value, String> = match format {
        "toml" => toml::from_str::<toml::Value>(content)
            .map_err(|e| e.to_string())
            .and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        "json" => serde_json::from_str(content).map_err(|e| e.to_string()),
        other => Err(format!("unsupported config format: .{other}")),
    };
    let value = match parsed {
        Ok(serde_json::Value::Null) => serde_json::Value::Object(serde_json::Map::new()),
        Ok(value) => value,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("{format} syntax error: {e}"),
            ));
            return finish(diagnostics);
        },
    };

    // 2. Unknown fields
    check_unknown_fields(&value, &build_schema_map(), "", &mut diagnostics);

    // 3. Types, then semantics on the typed config
    match serde_json::from_value::<ConveyorConfig>(value) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    finish(diagnostics)
}

/// Run the semantic checks on an already typed config, e.g. one assembled
/// in code rather than read from a file.
#[must_use]
pub fn validate_config(config: &ConveyorConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();
    check_semantics(config, &mut diagnostics);
    finish(diagnostics)
}

fn finish(diagnostics: Vec<Diagnostic>) -> ValidationResult {
    #[cfg(feature = "metrics")]
    for diagnostic in &diagnostics {
        counter!(
            config_metrics::DIAGNOSTICS_TOTAL,
            labels::SEVERITY => diagnostic.severity.to_string()
        )
        .increment(1);
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (serde_json::Value::Object(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };
    let known_keys: Vec<&str> = fields.keys().copied().collect();
    for (key, child) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match fields.get(key.as_str()) {
            Some(child_schema) => check_unknown_fields(child, child_schema, &path, diagnostics),
            None => {
                let level = if prefix.is_empty() {
                    " at top level"
                } else {
                    ""
                };
                let message = match suggest(key, &known_keys, 3) {
                    Some(s) => format!("unknown field{level} (did you mean \"{s}\"?)"),
                    None => format!("unknown field{level}"),
                };
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "unknown-field",
                    path,
                    message,
                ));
            },
        }
    }
}

fn check_semantics(config: &ConveyorConfig, diagnostics: &mut Vec<Diagnostic>) {
    let endpoint = &config.endpoint;
    if endpoint.name.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "semantic",
            "endpoint.name",
            "endpoint name must not be empty",
        ));
    }
    if endpoint.concurrency == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "semantic",
            "endpoint.concurrency",
            "concurrency must be at least 1",
        ));
    }
    if endpoint
        .instance_discriminator
        .as_deref()
        .is_some_and(|d| d.trim().is_empty())
    {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "semantic",
            "endpoint.instance_discriminator",
            "empty instance discriminator is ignored; instance routing will fail",
        ));
    }
    if endpoint.send_only {
        if endpoint.public_return_address.is_some() {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "semantic",
                "endpoint.public_return_address",
                "send-only endpoints do not receive replies; the public return address is ignored",
            ));
        }
        if !config.routing.publishers.is_empty() {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "semantic",
                "routing.publishers",
                "send-only endpoints cannot subscribe to events; publishers are unused",
            ));
        }
    }

    let recoverability = &config.recoverability;
    if recoverability.error_queue.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "semantic",
            "recoverability.error_queue",
            "error queue must not be empty",
        ));
    }
    if let Err(e) = parse_duration(&recoverability.time_increase) {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "semantic",
            "recoverability.time_increase",
            e.to_string(),
        ));
    }
    if recoverability.immediate_retries == 0 && recoverability.delayed_retries == 0 {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "semantic",
            "recoverability",
            "retries are disabled; failed messages go straight to the error queue",
        ));
    }

    for (section, entries) in [
        ("routing.routes", &config.routing.routes),
        ("routing.publishers", &config.routing.publishers),
    ] {
        for (message_type, destination) in entries {
            if destination.trim().is_empty() {
                diagnostics.push(Diagnostic::new(
                    Severity::Error,
                    "semantic",
                    format!("{section}.{message_type}"),
                    "destination must not be empty",
                ));
            }
        }
    }
    if config.routing.subscription_mode == SubscriptionModeConfig::Native
        && !config.routing.publishers.is_empty()
    {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "semantic",
            "routing.publishers",
            "publishers are only used with message_driven subscriptions",
        ));
    }
}
