// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Regex processing rules applied to a string field of the event.
//!
//! ```json
//! [
//!   {"type": "exclude_at_match", "name": "health", "pattern": "GET /health"},
//!   {"type": "mask_sequences", "name": "cards", "pattern": "\\d{4}-\\d{4}-\\d{4}-\\d{4}",
//!    "replace_placeholder": "[CARD]"},
//!   {"type": "include_at_match", "name": "errors", "field": "log.level", "pattern": "error"}
//! ]
//! ```
//!
//! Rules run in order. Events missing the field, or whose field is not a
//! string, are left to the remaining rules untouched.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;

use super::{Processor, Verdict};
use crate::errors::{ConfigError, ProcessorError};
use crate::event::Event;

const DEFAULT_FIELD: &str = "message";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    /// Drop events whose field matches.
    ExcludeAtMatch,
    /// Drop events whose field does not match.
    IncludeAtMatch,
    /// Replace every match with the placeholder.
    MaskSequences,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProcessingRule {
    #[serde(rename = "type")]
    pub kind: Kind,
    pub name: String,
    #[serde(default)]
    pub field: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub replace_placeholder: Option<String>,
}

#[derive(Clone, Debug)]
struct Rule {
    kind: Kind,
    field: String,
    regex: regex::Regex,
    placeholder: String,
}

#[derive(Debug)]
pub struct RulesProcessor {
    rules: Vec<Rule>,
    names: Vec<String>,
}

impl RulesProcessor {
    /// Compiles every rule. A pattern that fails to compile rejects the whole
    /// set.
    pub fn new(rules: &[ProcessingRule]) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let regex = regex::Regex::new(&rule.pattern).map_err(|e| ConfigError::InvalidRule {
                name: rule.name.clone(),
                reason: e.to_string(),
            })?;
            if rule.kind == Kind::MaskSequences && rule.replace_placeholder.is_none() {
                return Err(ConfigError::InvalidRule {
                    name: rule.name.clone(),
                    reason: "mask_sequences requires replace_placeholder".to_string(),
                });
            }
            compiled.push(Rule {
                kind: rule.kind,
                field: rule.field.clone().unwrap_or_else(|| DEFAULT_FIELD.to_string()),
                regex,
                placeholder: rule.replace_placeholder.clone().unwrap_or_default(),
            });
        }
        Ok(Self {
            rules: compiled,
            names: rules.iter().map(|r| r.name.clone()).collect(),
        })
    }

    /// Parses rules from a JSON array, as found in configuration.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let rules: Vec<ProcessingRule> = serde_json::from_str(raw).map_err(|e| {
            ConfigError::Invalid(format!("failed to parse processing rules: {e}"))
        })?;
        Self::new(&rules)
    }
}

impl Processor for RulesProcessor {
    fn run(&self, event: &mut Event) -> Result<Verdict, ProcessorError> {
        for rule in &self.rules {
            let Some(Value::String(text)) = event.get_value(&rule.field) else {
                continue;
            };
            match rule.kind {
                Kind::ExcludeAtMatch => {
                    if rule.regex.is_match(text) {
                        return Ok(Verdict::Drop);
                    }
                }
                Kind::IncludeAtMatch => {
                    if !rule.regex.is_match(text) {
                        return Ok(Verdict::Drop);
                    }
                }
                Kind::MaskSequences => {
                    let masked = rule
                        .regex
                        .replace_all(text, rule.placeholder.as_str())
                        .into_owned();
                    event.put_value(&rule.field, Value::String(masked));
                }
            }
        }
        Ok(Verdict::Keep)
    }
}

impl fmt::Display for RulesProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "processing_rules=[{}]", self.names.join(","))
    }
}
