//! Rule compilation and evaluation.
//!
//! Match and summary expressions are CEL programs. Audit rules see the source
//! record as the `audit` variable, event rules as `event`. A summary program
//! may return either a plain string or a map of the form
//! `{"summary": "...", "links": [{"marker": ..., "resource": {...}}]}`.

use cel_interpreter::objects::Key;
use cel_interpreter::{Context, Program, Value as CelValue};
use serde_json::Value;

use crate::crd::{ActivityPolicy, PolicyRule};

/* ============================= ERRORS ============================= */

/// Classified evaluation failures.
///
/// Each variant maps onto a dead-letter error type; the split between match
/// and summary failures is load-bearing for diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy '{policy}' rule {rule_index}: match expression failed: {message}")]
    CelMatch {
        policy: String,
        rule_index: i32,
        message: String,
    },

    #[error("policy '{policy}' rule {rule_index}: summary expression failed: {message}")]
    CelSummary {
        policy: String,
        rule_index: i32,
        message: String,
    },

    #[error("policy '{policy}' rule {rule_index}: {expression} expression does not compile: {message}")]
    Compile {
        policy: String,
        rule_index: i32,
        expression: &'static str,
        message: String,
    },

    #[error("could not resolve kind for resource '{resource}' in group '{api_group}'")]
    KindResolve { api_group: String, resource: String },
}

impl PolicyError {
    /// Policy name carried by the error, when one applies.
    pub fn policy_name(&self) -> Option<&str> {
        match self {
            PolicyError::CelMatch { policy, .. }
            | PolicyError::CelSummary { policy, .. }
            | PolicyError::Compile { policy, .. } => Some(policy),
            PolicyError::KindResolve { .. } => None,
        }
    }

    /// Rule index carried by the error; -1 when the failure precedes rule
    /// evaluation.
    pub fn rule_index(&self) -> i32 {
        match self {
            PolicyError::CelMatch { rule_index, .. }
            | PolicyError::CelSummary { rule_index, .. }
            | PolicyError::Compile { rule_index, .. } => *rule_index,
            PolicyError::KindResolve { .. } => -1,
        }
    }
}

/* ============================= COMPILED FORMS ============================= */

/// A rule with both expressions compiled.
#[derive(Debug)]
pub struct CompiledRule {
    match_program: Program,
    summary_program: Program,
}

/// A policy whose rule expressions have all been compiled.
///
/// Immutable once built; the cache replaces whole entries on update.
#[derive(Debug)]
pub struct CompiledPolicy {
    pub name: String,
    pub api_group: String,
    pub kind: String,
    pub audit_rules: Vec<CompiledRule>,
    pub event_rules: Vec<CompiledRule>,
}

/// A link binding produced by a summary expression.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkBinding {
    pub marker: String,
    pub resource: serde_json::Map<String, Value>,
}

/// Result of a successful policy match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPolicy {
    pub policy_name: String,
    pub api_group: String,
    pub kind: String,
    pub summary: String,
    pub links: Vec<LinkBinding>,
}

/// CEL variable name audit rules evaluate against.
pub const AUDIT_VAR: &str = "audit";
/// CEL variable name event rules evaluate against.
pub const EVENT_VAR: &str = "event";

fn compile_rules(
    policy: &str,
    rules: &[PolicyRule],
) -> Result<Vec<CompiledRule>, PolicyError> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let match_program =
                Program::compile(&rule.match_expression).map_err(|e| PolicyError::Compile {
                    policy: policy.to_string(),
                    rule_index: i as i32,
                    expression: "match",
                    message: e.to_string(),
                })?;
            let summary_program =
                Program::compile(&rule.summary).map_err(|e| PolicyError::Compile {
                    policy: policy.to_string(),
                    rule_index: i as i32,
                    expression: "summary",
                    message: e.to_string(),
                })?;
            Ok(CompiledRule {
                match_program,
                summary_program,
            })
        })
        .collect()
}

/// Compile every expression of a policy. Any failure rejects the whole
/// policy; partial installs are never produced.
pub fn compile_policy(policy: &ActivityPolicy) -> Result<CompiledPolicy, PolicyError> {
    let name = policy
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    Ok(CompiledPolicy {
        api_group: policy.spec.resource.api_group.clone(),
        kind: policy.spec.resource.kind.clone(),
        audit_rules: compile_rules(&name, &policy.spec.audit_rules)?,
        event_rules: compile_rules(&name, &policy.spec.event_rules)?,
        name,
    })
}

/* ============================= EVALUATION ============================= */

fn evaluate(program: &Program, var: &str, payload: &Value) -> Result<CelValue, String> {
    let mut ctx = Context::default();
    ctx.add_variable(var, payload).map_err(|e| e.to_string())?;
    program.execute(&ctx).map_err(|e| e.to_string())
}

fn cel_key_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.as_ref().clone(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}

/// Convert an evaluated CEL value into plain JSON.
fn cel_to_json(value: &CelValue) -> Value {
    match value {
        CelValue::Null => Value::Null,
        CelValue::Bool(b) => Value::Bool(*b),
        CelValue::Int(i) => Value::from(*i),
        CelValue::UInt(u) => Value::from(*u),
        CelValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CelValue::String(s) => Value::String(s.as_ref().clone()),
        CelValue::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        CelValue::List(items) => Value::Array(items.iter().map(cel_to_json).collect()),
        CelValue::Map(map) => {
            let mut object = serde_json::Map::new();
            for (k, v) in map.map.iter() {
                object.insert(cel_key_string(k), cel_to_json(v));
            }
            Value::Object(object)
        }
        CelValue::Timestamp(t) => Value::String(t.to_rfc3339()),
        CelValue::Duration(d) => Value::String(d.to_string()),
        _ => Value::Null,
    }
}

/// Decode the summary program's result into (summary, links).
fn decode_summary(value: &CelValue) -> Result<(String, Vec<LinkBinding>), String> {
    match cel_to_json(value) {
        Value::String(summary) => Ok((summary, Vec::new())),
        Value::Object(map) => {
            let summary = map
                .get("summary")
                .and_then(Value::as_str)
                .ok_or_else(|| "summary map is missing a 'summary' string".to_string())?
                .to_string();

            let mut links = Vec::new();
            if let Some(raw_links) = map.get("links") {
                let items = raw_links
                    .as_array()
                    .ok_or_else(|| "'links' must be a list".to_string())?;
                for item in items {
                    let obj = item
                        .as_object()
                        .ok_or_else(|| "each link must be a map".to_string())?;
                    let marker = obj
                        .get("marker")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "link is missing a 'marker' string".to_string())?
                        .to_string();
                    let resource = obj
                        .get("resource")
                        .and_then(Value::as_object)
                        .cloned()
                        .ok_or_else(|| "link is missing a 'resource' map".to_string())?;
                    links.push(LinkBinding { marker, resource });
                }
            }
            Ok((summary, links))
        }
        other => Err(format!(
            "summary expression must return a string or a map, got {other}"
        )),
    }
}

impl CompiledPolicy {
    fn match_rules(
        &self,
        rules: &[CompiledRule],
        var: &str,
        payload: &Value,
    ) -> Result<Option<MatchedPolicy>, PolicyError> {
        for (index, rule) in rules.iter().enumerate() {
            let matched = match evaluate(&rule.match_program, var, payload) {
                Ok(CelValue::Bool(b)) => b,
                Ok(other) => {
                    return Err(PolicyError::CelMatch {
                        policy: self.name.clone(),
                        rule_index: index as i32,
                        message: format!(
                            "match expression returned {:?} instead of a boolean",
                            cel_to_json(&other)
                        ),
                    });
                }
                Err(message) => {
                    return Err(PolicyError::CelMatch {
                        policy: self.name.clone(),
                        rule_index: index as i32,
                        message,
                    });
                }
            };
            if !matched {
                continue;
            }

            let value = evaluate(&rule.summary_program, var, payload).map_err(|message| {
                PolicyError::CelSummary {
                    policy: self.name.clone(),
                    rule_index: index as i32,
                    message,
                }
            })?;
            let (summary, links) =
                decode_summary(&value).map_err(|message| PolicyError::CelSummary {
                    policy: self.name.clone(),
                    rule_index: index as i32,
                    message,
                })?;

            return Ok(Some(MatchedPolicy {
                policy_name: self.name.clone(),
                api_group: self.api_group.clone(),
                kind: self.kind.clone(),
                summary,
                links,
            }));
        }
        Ok(None)
    }

    /// Evaluate audit rules in declared order; first match wins.
    pub fn match_audit(&self, audit: &Value) -> Result<Option<MatchedPolicy>, PolicyError> {
        self.match_rules(&self.audit_rules, AUDIT_VAR, audit)
    }

    /// Evaluate event rules in declared order; first match wins.
    pub fn match_event(&self, event: &Value) -> Result<Option<MatchedPolicy>, PolicyError> {
        self.match_rules(&self.event_rules, EVENT_VAR, event)
    }
}

/* ============================= TESTS ============================= */
