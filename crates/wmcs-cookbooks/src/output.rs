//! Decoding of structured tool output (JSON / YAML).
//!
//! Every external tool gets its own typed schema (see the `ceph` and `k8s`
//! modules); this module only provides the shared decode step and the error
//! that carries the offending output back to the operator.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("malformed {tool} output ({reason}):\n{raw}")]
    Malformed {
        tool: String,
        reason: String,
        raw: String,
    },
}

impl OutputError {
    pub fn malformed(tool: &str, reason: impl Into<String>, raw: &str) -> Self {
        OutputError::Malformed {
            tool: tool.to_string(),
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}

pub fn parse<T: DeserializeOwned>(tool: &str, format: OutputFormat, raw: &str) -> Result<T, OutputError> {
    match format {
        OutputFormat::Json => {
            serde_json::from_str(raw).map_err(|e| OutputError::malformed(tool, e.to_string(), raw))
        }
        OutputFormat::Yaml => {
            serde_yaml::from_str(raw).map_err(|e| OutputError::malformed(tool, e.to_string(), raw))
        }
    }
}

pub fn parse_json<T: DeserializeOwned>(tool: &str, raw: &str) -> Result<T, OutputError> {
    parse(tool, OutputFormat::Json, raw)
}

/// Removes ANSI colour sequences (`ESC [ ... m`) that some tools emit even
/// when not attached to a terminal.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for inner in chars.by_ref() {
                if inner.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}
