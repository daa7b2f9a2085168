use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;

use crate::types::ToolExecutionRequest;

/// Hex characters of the argument digest kept in a key
const HASH_LEN: usize = 16;

/// Deterministic fingerprint of (server, tool, canonicalized arguments)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    server: String,
    tool: String,
    args_hash: String,
}

impl CacheKey {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, arguments: &Map<String, Value>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args_hash: hash_arguments(arguments),
        }
    }

    pub fn for_request(request: &ToolExecutionRequest) -> Self {
        Self::new(&request.server, &request.tool, &request.arguments)
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn args_hash(&self) -> &str {
        &self.args_hash
    }

    /// `server:tool:hash`
    pub fn fingerprint(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.server, self.tool, self.args_hash)
    }
}

/// Trim and lower-case top-level argument names, trim top-level string values
fn normalize(arguments: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut normalized: Vec<(String, Value)> = arguments
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other.clone(),
            };
            (name.trim().to_lowercase(), value)
        })
        .collect();
    normalized.sort_by(|a, b| a.0.cmp(&b.0));
    normalized
}

/// JSON with object keys sorted at every level
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

fn hash_arguments(arguments: &Map<String, Value>) -> String {
    let mut canonical = String::from("{");
    for (i, (name, value)) in normalize(arguments).iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        write_string(name, &mut canonical);
        canonical.push(':');
        write_canonical(value, &mut canonical);
    }
    canonical.push('}');

    let digest = Sha256::digest(canonical.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LEN);
    hash
}
