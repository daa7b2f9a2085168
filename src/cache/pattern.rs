use regex::Regex;

use super::key::CacheKey;
use super::CacheError;

/// Glob over `server` or `server:tool`, with `*` and `?` wildcards
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    server: Regex,
    tool: Option<Regex>,
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".into(),
            });
        }

        let (server, tool) = match trimmed.split_once(':') {
            Some((server, tool)) => (server, Some(tool)),
            None => (trimmed, None),
        };

        Ok(Self {
            raw: trimmed.to_string(),
            server: glob_to_regex(pattern, server)?,
            tool: tool.map(|t| glob_to_regex(pattern, t)).transpose()?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        self.server.is_match(key.server())
            && self.tool.as_ref().map_or(true, |tool| tool.is_match(key.tool()))
    }
}

fn glob_to_regex(pattern: &str, glob: &str) -> Result<Regex, CacheError> {
    if glob.is_empty() || glob.contains(':') {
        return Err(CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "expected `server` or `server:tool`".into(),
        });
    }

    let mut expr = String::with_capacity(glob.len() + 8);
    expr.push('^');
    for c in glob.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
