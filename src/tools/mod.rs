//! Tool catalogue and invocation resolution.
//!
//! Raw invocations carry loosely-typed arguments (tag-form values are always
//! strings). [`resolve`] looks the tool up, coerces arguments by declared
//! parameter type, and deserializes them into a typed [`ToolCommand`].
//! Unknown names map to [`ToolError::NotFound`]; anything that fails to
//! deserialize maps to [`ToolError::InvalidArguments`].

pub mod catalogue;
pub mod command;

pub use catalogue::{CATALOGUE, ExecutionSite, ParamType, ToolSpec, spec, tool_descriptions};
pub use command::{AgentCommand, SandboxCommand, ToolCommand};

use serde_json::{Map, Value, json};

use crate::error::ToolError;
use crate::protocol::ToolInvocation;

/// Resolve an invocation into a typed command.
pub fn resolve(invocation: &ToolInvocation) -> Result<ToolCommand, ToolError> {
    resolve_parts(&invocation.name, invocation.args.clone())
}

/// Resolve a tool name plus raw arguments.
pub fn resolve_parts(name: &str, args: Map<String, Value>) -> Result<ToolCommand, ToolError> {
    let spec = spec(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
    let args = coerce_arguments(spec, args);

    let invalid = |message: String| ToolError::InvalidArguments {
        tool: spec.name.to_string(),
        message,
    };

    if let Some(missing) = spec
        .params
        .iter()
        .find(|p| p.required && args.get(p.name).is_none_or(Value::is_null))
    {
        return Err(invalid(format!("missing required parameter '{}'", missing.name)));
    }

    let payload = json!({ "tool": spec.name, "args": Value::Object(args) });
    match spec.site {
        ExecutionSite::Agent => serde_json::from_value::<AgentCommand>(payload)
            .map(ToolCommand::Agent)
            .map_err(|e| invalid(e.to_string())),
        ExecutionSite::Sandbox => serde_json::from_value::<SandboxCommand>(payload)
            .map(ToolCommand::Sandbox)
            .map_err(|e| invalid(e.to_string())),
    }
}

/// Convert string-typed values to the parameter's declared type where the
/// conversion is unambiguous. Values that do not convert are left alone so
/// deserialization reports them.
pub fn coerce_arguments(spec: &ToolSpec, mut args: Map<String, Value>) -> Map<String, Value> {
    for p in spec.params {
        let Some(Value::String(raw)) = args.get(p.name) else {
            continue;
        };
        let trimmed = raw.trim();
        let converted = match p.ty {
            ParamType::String => None,
            ParamType::Integer => trimmed.parse::<i64>().ok().map(Value::from),
            ParamType::Boolean => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(Value::Bool(true)),
                "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
        };
        if let Some(value) = converted {
            args.insert(p.name.to_string(), value);
        }
    }
    args
}
