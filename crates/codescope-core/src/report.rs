//! Analysis reports and structured agent output handling.
//!
//! A report is assembled once, after every node of a run is terminal, so
//! its content does not depend on the order in which sibling nodes
//! finished. It always has exactly one entry per role of the run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::{AnalysisSettings, Depth, Verbosity};
use crate::context::truncate_chars;
use crate::error::FailureReason;
use crate::graph::NodeState;
use crate::roles::AgentRole;

/// Terminal result of one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleOutcome {
    Done { output: Value },
    Failed { reason: FailureReason },
}

impl RoleOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, RoleOutcome::Done { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Run id.
    pub id: String,
    pub snapshot_id: String,
    pub depth: Depth,
    pub verbosity: Verbosity,
    pub requested_roles: Vec<AgentRole>,
    pub started_at: i64,
    pub finished_at: i64,
    pub entries: BTreeMap<AgentRole, RoleOutcome>,
}

impl AnalysisReport {
    /// Aggregate the terminal node states of a run.
    ///
    /// A node that is somehow not terminal is recorded as cancelled, so the
    /// report still carries one entry per role.
    pub fn assemble(
        id: impl Into<String>,
        snapshot_id: impl Into<String>,
        settings: &AnalysisSettings,
        started_at: i64,
        finished_at: i64,
        states: Vec<(AgentRole, NodeState)>,
    ) -> Self {
        let entries = states
            .into_iter()
            .map(|(role, state)| {
                let outcome = match state {
                    NodeState::Done(output) => RoleOutcome::Done { output },
                    NodeState::Failed(reason) => RoleOutcome::Failed { reason },
                    _ => RoleOutcome::Failed {
                        reason: FailureReason::Cancelled,
                    },
                };
                (role, outcome)
            })
            .collect();

        Self {
            id: id.into(),
            snapshot_id: snapshot_id.into(),
            depth: settings.depth,
            verbosity: settings.verbosity,
            requested_roles: settings.roles.clone(),
            started_at,
            finished_at,
            entries,
        }
    }

    /// True when every role produced output.
    pub fn succeeded(&self) -> bool {
        self.entries.values().all(RoleOutcome::is_done)
    }

    pub fn failed_roles(&self) -> Vec<AgentRole> {
        self.entries
            .iter()
            .filter(|(_, o)| !o.is_done())
            .map(|(r, _)| *r)
            .collect()
    }

    pub fn output(&self, role: AgentRole) -> Option<&Value> {
        match self.entries.get(&role) {
            Some(RoleOutcome::Done { output }) => Some(output),
            _ => None,
        }
    }

    /// One excerpt per top-level key of every successful role output.
    pub fn excerpts(&self, max_chars: usize) -> Vec<ReportExcerpt> {
        let mut out = Vec::new();
        for (role, outcome) in &self.entries {
            let RoleOutcome::Done { output } = outcome else {
                continue;
            };
            let Some(object) = output.as_object() else {
                continue;
            };
            for (key, value) in object {
                let text = value_to_text(value);
                if text.trim().is_empty() {
                    continue;
                }
                out.push(ReportExcerpt {
                    role: *role,
                    key: key.clone(),
                    text: truncate_chars(&text, max_chars),
                });
            }
        }
        out
    }

    /// Markdown rendering for terminal output.
    pub fn to_markdown(&self) -> String {
        let mut md = format!(
            "# Analysis report {}\n\nsnapshot: {}  depth: {}  verbosity: {}\n",
            self.id, self.snapshot_id, self.depth, self.verbosity
        );
        for (role, outcome) in &self.entries {
            md.push_str(&format!("\n## {} ({})\n\n", role.title(), role));
            match outcome {
                RoleOutcome::Done { output } => match output.as_object() {
                    Some(object) => {
                        for (key, value) in object {
                            md.push_str(&format!("**{}**: {}\n\n", key, value_to_text(value)));
                        }
                    }
                    None => md.push_str(&format!("{}\n", value_to_text(output))),
                },
                RoleOutcome::Failed { reason } => {
                    md.push_str(&format!("_failed: {}_\n", reason));
                }
            }
        }
        md
    }
}

/// A piece of a role's output that can be quoted in chat context.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportExcerpt {
    pub role: AgentRole,
    pub key: String,
    pub text: String,
}

/// Flatten a JSON value into readable text.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) => items
            .iter()
            .map(item_to_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, value_to_text(v)))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn item_to_text(item: &Value) -> String {
    if let Value::Object(map) = item {
        let name = map.get("name").or_else(|| map.get("title")).and_then(Value::as_str);
        let detail = map
            .get("description")
            .or_else(|| map.get("summary"))
            .or_else(|| map.get("purpose"))
            .and_then(Value::as_str);
        match (name, detail) {
            (Some(n), Some(d)) => return format!("{}: {}", n, d),
            (Some(n), None) => return n.to_string(),
            _ => {}
        }
    }
    value_to_text(item)
}

/// Find the JSON object in a model response.
///
/// Tries, in order: the whole response, a ```` ```json ```` fence, any
/// ```` ``` ```` fence, and the first balanced `{...}` span. Only objects
/// are accepted.
pub fn extract_json(text: &str) -> Option<Value> {
    let parse = |s: &str| match serde_json::from_str::<Value>(s.trim()) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    };

    if let Some(v) = parse(text) {
        return Some(v);
    }
    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let body = &text[start + fence.len()..];
            if let Some(end) = body.find("```") {
                if let Some(v) = parse(&body[..end]) {
                    return Some(v);
                }
            }
        }
    }
    balanced_object(text).and_then(parse)
}

/// The first `{...}` span with balanced braces, ignoring braces in strings.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract and check a role's structured output.
pub fn parse_role_output(role: AgentRole, response: &str) -> Result<Value, FailureReason> {
    let value = extract_json(response).ok_or_else(|| FailureReason::InvalidOutput {
        message: "response contained no JSON object".to_string(),
    })?;
    let missing: Vec<&str> = role
        .required_keys()
        .iter()
        .copied()
        .filter(|key| value.get(key).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(FailureReason::InvalidOutput {
            message: format!("missing keys: {}", missing.join(", ")),
        });
    }
    Ok(value)
}
