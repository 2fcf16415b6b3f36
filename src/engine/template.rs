use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

use crate::types::StepContext;

/// Fields tried, in order, when a reference cannot be resolved and the step's
/// output has to stand in for itself.
const SUMMARY_FIELDS: [&str; 5] = ["insight", "summary", "analysis", "description", "content"];

fn placeholder() -> Option<&'static Regex> {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+)((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}").ok())
        .as_ref()
}

/// Substitute `{{step-id.path.to.field}}` references with values from the
/// outputs of completed steps.
///
/// A leading `output` segment is ignored since the context already holds
/// unwrapped outputs. Objects and arrays are inserted as JSON. A path that
/// does not resolve falls back to the step's summary text. References to
/// steps missing from the context are left untouched.
pub fn resolve_template(template: &str, context: &StepContext) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };

    re.replace_all(template, |caps: &Captures| {
        let step_id = &caps[1];
        let Some(output) = context.get(step_id) else {
            return caps[0].to_string();
        };

        let mut path: Vec<&str> = caps
            .get(2)
            .map(|m| m.as_str().split('.').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        if path.first() == Some(&"output") {
            path.remove(0);
        }

        match lookup(output, &path) {
            Some(value) => render(value),
            None => summarize(output),
        }
    })
    .into_owned()
}

fn lookup<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() {
        return None;
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Best-effort text for a step output.
pub fn summarize(output: &Value) -> String {
    if let Value::Object(map) = output {
        for field in SUMMARY_FIELDS {
            if let Some(Value::String(text)) = map.get(field) {
                if !text.is_empty() {
                    return text.clone();
                }
            }
        }
    }
    render(output)
}
