//! Input sanitization
//!
//! Pattern-based screening of every string field in the envelope before any
//! reasoning happens. The patterns target injection primitives: SQL
//! statements, shell metacharacters, and path traversal.

use regex::Regex;

use crate::types::RequestEnvelope;

struct Pattern {
    regex: Regex,
    label: &'static str,
}

/// Screens request envelopes for hostile input.
pub struct Sanitizer {
    patterns: Vec<Pattern>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        let sources: &[(&str, &str)] = &[
            (r"(?i)\b(drop|truncate|alter)\s+table\b", "sql statement"),
            (r"(?i)\bdelete\s+from\b", "sql statement"),
            (r"(?i)\bunion\s+select\b", "sql injection"),
            (r"\.\./|\.\.\\", "path traversal"),
            (r"[;`]|\$\(|&&|\|\|?", "shell metacharacter"),
            (r"(?i)\brm\s+-rf\b", "destructive shell command"),
        ];
        Self {
            patterns: sources
                .iter()
                .map(|&(source, label)| Pattern {
                    regex: Regex::new(source).expect("sanitizer pattern"),
                    label,
                })
                .collect(),
        }
    }
}

impl Sanitizer {
    /// Check every string in the envelope. Returns the first violation.
    pub fn check(&self, envelope: &RequestEnvelope) -> Result<(), String> {
        self.check_str(&envelope.query)?;
        for (key, value) in &envelope.fields {
            self.check_value(key, value)?;
        }
        Ok(())
    }

    fn check_value(&self, key: &str, value: &serde_json::Value) -> Result<(), String> {
        match value {
            serde_json::Value::String(s) => self
                .check_str(s)
                .map_err(|reason| format!("field '{}': {}", key, reason)),
            serde_json::Value::Array(items) => {
                for item in items {
                    self.check_value(key, item)?;
                }
                Ok(())
            }
            serde_json::Value::Object(map) => {
                for (inner_key, inner) in map {
                    self.check_value(inner_key, inner)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_str(&self, text: &str) -> Result<(), String> {
        for pattern in &self.patterns {
            if pattern.regex.is_match(text) {
                return Err(format!("input contains a {}", pattern.label));
            }
        }
        Ok(())
    }
}
