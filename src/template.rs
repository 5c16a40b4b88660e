//! Minimal text templates for alert rules and webhook payloads.
//!
//! Supported actions:
//! - `{{ .field }}` and `{{ .a.b }}`: value lookup, strings are inserted raw
//! - `{{ json .field }}`: JSON encoding of the value (quoted strings etc.)
//! - `{{ . }}`: the whole data object as JSON
//!
//! Missing fields render as an empty string.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::NotificationError;

static ACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("template action regex is valid"));

static PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\.([A-Za-z0-9_]+(\.[A-Za-z0-9_]+)*)?$").expect("template path regex is valid"));

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
}

#[derive(Debug, Clone)]
enum Part {
    Text(String),
    Value(Vec<String>),
    Json(Vec<String>),
}

impl Template {
    pub fn parse(text: &str) -> Result<Self, NotificationError> {
        let mut parts = Vec::new();
        let mut last = 0;
        for cap in ACTION.captures_iter(text) {
            let (Some(whole), Some(action)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            if whole.start() > last {
                parts.push(Part::Text(text[last..whole.start()].to_string()));
            }
            parts.push(parse_action(action.as_str())?);
            last = whole.end();
        }
        let rest = &text[last..];
        if rest.contains("{{") {
            return Err(NotificationError::Template {
                message: "unclosed action".to_string(),
            });
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn render(&self, data: &Value) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Text(t) => out.push_str(t),
                Part::Value(path) => match lookup(data, path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(v) => out.push_str(&v.to_string()),
                },
                Part::Json(path) => {
                    let v = lookup(data, path).unwrap_or(&Value::Null);
                    out.push_str(&v.to_string());
                }
            }
        }
        out
    }
}

fn parse_action(action: &str) -> Result<Part, NotificationError> {
    let (is_json, expr) = match action.strip_prefix("json ") {
        Some(rest) => (true, rest.trim()),
        None => (false, action),
    };
    if !PATH.is_match(expr) {
        return Err(NotificationError::Template {
            message: format!("unsupported action: {action}"),
        });
    }
    let path: Vec<String> = expr
        .trim_start_matches('.')
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Ok(if is_json { Part::Json(path) } else { Part::Value(path) })
}

fn lookup<'a>(data: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(data, |v, key| v.get(key.as_str()))
}

/// Parses and renders in one step.
pub fn render(text: &str, data: &Value) -> Result<String, NotificationError> {
    Ok(Template::parse(text)?.render(data))
}

/// Renders, falling back to the raw text when the template is malformed.
pub fn render_or_raw(text: &str, data: &Value) -> String {
    render(text, data).unwrap_or_else(|_| text.to_string())
}
