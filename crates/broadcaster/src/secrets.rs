//! Credential resolution for broadcaster tokens.
//!
//! The access token and the broadcaster auth key can be supplied to the
//! configuration in three ways, resolved in priority order:
//!
//! 1. **Inline value** - `"authKey": "abc123"` or `"authKey": { "value": "abc123" }`
//! 2. **File reference** - `"authKey": { "file": "/run/secrets/auth_key" }`
//! 3. **Env var reference** - `"authKey": { "envVar": "BROADCASTER_AUTH_KEY" }`

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;

/// Error type for secret resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: value, file, or envVar)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },
}

/// Result type for secret resolution.
pub type Result<T> = std::result::Result<T, SecretError>;

/// Where a credential comes from, as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SecretSource {
    Inline(String),
    Reference(SecretReference),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

impl SecretSource {
    pub fn resolve(&self) -> Result<SecretString> {
        match self {
            SecretSource::Inline(value) => resolve_secret(Some(value), None, None),
            SecretSource::Reference(reference) => resolve_secret(
                reference.value.as_deref(),
                reference.file.as_deref(),
                reference.env_var.as_deref(),
            ),
        }
    }

    /// True if at least one non-empty source is configured.
    pub fn is_configured(&self) -> bool {
        match self {
            SecretSource::Inline(value) => !value.is_empty(),
            SecretSource::Reference(r) => {
                r.value.as_deref().is_some_and(|s| !s.is_empty())
                    || r.file.as_deref().is_some_and(|s| !s.is_empty())
                    || r.env_var.as_deref().is_some_and(|s| !s.is_empty())
            }
        }
    }
}

/// Resolves a secret from the first non-empty source: inline value, file
/// contents, then environment variable.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        return fs::read_to_string(&expanded)
            .map(|content| SecretString::from(content.trim().to_string()))
            .map_err(|source| SecretError::FileReadError {
                path: expanded,
                source,
            });
    }

    if let Some(name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(name) {
            // env vars may carry a trailing newline
            Ok(value) => Ok(SecretString::from(value.trim().to_string())),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Expands a leading `~` to the user's home directory. `~user/...` is not supported.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
