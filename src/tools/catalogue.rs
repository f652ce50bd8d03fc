//! Static tool specs exposed to the model.

use serde_json::{Map, Value, json};

/// Where an invocation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionSite {
    /// In-process, by the orchestrator (agent-graph tools).
    Agent,
    /// By the sandbox worker.
    Sandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
}

impl ParamType {
    fn json_type(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
        }
    }
}

#[derive(Debug)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub site: ExecutionSite,
    /// Sends traffic to an external target; gated by the scope policy.
    pub reaches_network: bool,
}

const fn param(
    name: &'static str,
    ty: ParamType,
    required: bool,
    description: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        ty,
        required,
        description,
    }
}

pub static CATALOGUE: &[ToolSpec] = &[
    ToolSpec {
        name: "create_agent",
        description: "Spawn a child agent to work on a sub-task. The child inherits a \
                      (possibly compacted) copy of your conversation unless \
                      inherit_context is false. Returns the new agent's id.",
        params: &[
            param("name", ParamType::String, true, "Short descriptive agent name"),
            param("task", ParamType::String, true, "The task the child must accomplish"),
            param("skills", ParamType::String, false, "Comma-separated skill tags"),
            param(
                "inherit_context",
                ParamType::Boolean,
                false,
                "Seed the child with your conversation (default true)",
            ),
        ],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "send_message_to_agent",
        description: "Post a message into another agent's mailbox. Delivered at the \
                      recipient's next poll point.",
        params: &[
            param("target_agent_id", ParamType::String, true, "Recipient agent id"),
            param("message", ParamType::String, true, "Message text"),
        ],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "wait_for_message",
        description: "Pause until another agent (or the user) sends you a message.",
        params: &[param("reason", ParamType::String, false, "Why you are waiting")],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "agent_finish",
        description: "Finish this (non-root) agent and report the result to the parent.",
        params: &[
            param("result_summary", ParamType::String, true, "What was accomplished"),
            param("success", ParamType::Boolean, false, "Whether the task succeeded (default true)"),
        ],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "finish_scan",
        description: "Complete the whole scan. Root agent only; every other agent must \
                      have finished first.",
        params: &[
            param("executive_summary", ParamType::String, true, "Executive summary"),
            param("methodology", ParamType::String, true, "Testing methodology"),
            param("technical_analysis", ParamType::String, true, "Technical analysis"),
            param("recommendations", ParamType::String, true, "Recommendations"),
        ],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "view_agent_graph",
        description: "Show the agent tree with each agent's status.",
        params: &[],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "stop_agent",
        description: "Ask an agent to stop at its next loop boundary.",
        params: &[param("agent_id", ParamType::String, true, "Agent to stop")],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "report_vulnerability",
        description: "Record a confirmed vulnerability.",
        params: &[
            param("title", ParamType::String, true, "Short title"),
            param("severity", ParamType::String, true, "critical, high, medium, low or info"),
            param("description", ParamType::String, true, "Details and reproduction steps"),
        ],
        site: ExecutionSite::Agent,
        reaches_network: false,
    },
    ToolSpec {
        name: "shell_exec",
        description: "Execute a shell command in the sandbox workspace via `sh -c`. \
                      Returns a JSON object with fields: stdout, stderr, exit_code, timed_out.",
        params: &[
            param("command", ParamType::String, true, "The shell command to execute"),
            param("timeout_secs", ParamType::Integer, false, "Per-command timeout"),
        ],
        site: ExecutionSite::Sandbox,
        reaches_network: false,
    },
    ToolSpec {
        name: "file_read",
        description: "Read a file inside the sandbox workspace.",
        params: &[param("path", ParamType::String, true, "Path relative to the workspace")],
        site: ExecutionSite::Sandbox,
        reaches_network: false,
    },
    ToolSpec {
        name: "file_write",
        description: "Write a file inside the sandbox workspace. Parent directories are \
                      created; paths outside the workspace are rejected.",
        params: &[
            param("path", ParamType::String, true, "Path relative to the workspace"),
            param("content", ParamType::String, true, "Content to write"),
        ],
        site: ExecutionSite::Sandbox,
        reaches_network: false,
    },
    ToolSpec {
        name: "http_request",
        description: "Send an HTTP request to an in-scope target. Returns status, headers \
                      and a truncated body.",
        params: &[
            param("url", ParamType::String, true, "Absolute URL"),
            param("method", ParamType::String, false, "HTTP method (default GET)"),
        ],
        site: ExecutionSite::Sandbox,
        reaches_network: true,
    },
];

/// Look up a tool by name.
pub fn spec(name: &str) -> Option<&'static ToolSpec> {
    CATALOGUE.iter().find(|t| t.name == name)
}

impl ToolSpec {
    /// JSON schema of the parameter object.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in self.params {
            properties.insert(
                p.name.to_string(),
                json!({ "type": p.ty.json_type(), "description": p.description }),
            );
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Human-readable tool list embedded in agent system prompts.
pub fn tool_descriptions() -> String {
    let mut out = String::new();
    for tool in CATALOGUE {
        out.push_str(&format!("### {}\n{}\n", tool.name, tool.description));
        for p in tool.params {
            let req = if p.required { "required" } else { "optional" };
            out.push_str(&format!(
                "- **{}** ({}, {}): {}\n",
                p.name,
                p.ty.json_type(),
                req,
                p.description
            ));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
