//! Extraction of tool invocations from model output.
//!
//! Two encodings are accepted:
//! - native structured calls (identifier + function name + JSON arguments)
//! - the embedded tag form
//!   `<function=name><parameter=key>value</parameter></function>`
//!
//! A single tag-form call truncated before its closing tag is repaired by
//! appending `</function>`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::message::DeclaredToolCall;

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<function=([^>]+)>\n?(.*?)</function>").expect("static regex")
});

static PARAMETER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<parameter=([^>]+)>(.*?)</parameter>").expect("static regex")
});

static INCOMPLETE_FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function=[^>]+>.*$").expect("static regex"));

static PARTIAL_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<f(?:u(?:n(?:c(?:t(?:i(?:o(?:n(?:=(?:[^>]*)?)?)?)?)?)?)?)?)?$")
        .expect("static regex")
});

static HIDDEN_BLOCK_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?si)<inter_agent_message>.*?</inter_agent_message>").expect("static regex"),
        Regex::new(r"(?si)<agent_completion_report>.*?</agent_completion_report>")
            .expect("static regex"),
    ]
});

static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("static regex"));

/// A request to run a named tool, parsed from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Native call identifier. `None` for tag-form invocations.
    pub id: Option<String>,
    pub name: String,
    pub args: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Build an invocation from a native declared call. Non-object argument
    /// payloads (some providers send a JSON string) are decoded when possible.
    pub fn from_declared(call: &DeclaredToolCall) -> Self {
        let args = match &call.arguments {
            Value::Object(map) => map.clone(),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            },
            _ => Map::new(),
        };
        let id = Some(call.id.clone()).filter(|id| !id.is_empty());
        Self {
            id,
            name: call.name.clone(),
            args,
        }
    }
}

/// Append a missing `</function>` to a single truncated tag-form call.
pub fn repair_truncated_call(content: &str) -> String {
    if content.matches("<function=").count() == 1 && !content.contains("</function>") {
        let trimmed = content.trim_end();
        if trimmed.ends_with("</") {
            return format!("{trimmed}function>");
        }
        return format!("{trimmed}\n</function>");
    }
    content.to_string()
}

/// Parse every tag-form invocation in `content`.
pub fn parse_tag_invocations(content: &str) -> Vec<ToolInvocation> {
    let content = repair_truncated_call(content);

    FUNCTION_RE
        .captures_iter(&content)
        .map(|caps| {
            let name = caps[1].trim().to_string();
            let body = &caps[2];
            let args = PARAMETER_RE
                .captures_iter(body)
                .map(|p| {
                    let key = p[1].trim().to_string();
                    let value = unescape_entities(p[2].trim());
                    (key, Value::String(value))
                })
                .collect();
            ToolInvocation::new(name, args)
        })
        .collect()
}

/// Collect the invocations carried by a model response. Native calls take
/// precedence; the tag form is only consulted when there are none.
pub fn extract_invocations(content: &str, native: &[DeclaredToolCall]) -> Vec<ToolInvocation> {
    if !native.is_empty() {
        return native.iter().map(ToolInvocation::from_declared).collect();
    }
    parse_tag_invocations(content)
}

/// Strip tool-call markup and internal envelope blocks from assistant text.
pub fn clean_content(content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    let repaired = repair_truncated_call(content);
    let mut cleaned = FUNCTION_RE.replace_all(&repaired, "").into_owned();
    cleaned = INCOMPLETE_FUNCTION_RE.replace_all(&cleaned, "").into_owned();
    cleaned = PARTIAL_TAG_RE.replace_all(&cleaned, "").into_owned();
    for re in HIDDEN_BLOCK_RES.iter() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    cleaned = BLANK_LINES_RE.replace_all(&cleaned, "\n\n").into_owned();
    cleaned.trim().to_string()
}

/// Render an invocation back into the tag form (used for legacy-mode
/// assistant turns and transcripts).
pub fn format_tag_invocation(name: &str, args: &Map<String, Value>) -> String {
    let mut parts = vec![format!("<function={name}>")];
    for (key, value) in args {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parts.push(format!("<parameter={key}>{rendered}</parameter>"));
    }
    parts.push("</function>".to_string());
    parts.join("\n")
}

/// Decode the HTML entities models commonly emit inside parameter values.
fn unescape_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let Some(end) = tail.find(';').filter(|&e| e <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" | "#39" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
