//! Typed tool commands, one variant per tool.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Agent-graph tools, executed in-process by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum AgentCommand {
    CreateAgent {
        name: String,
        task: String,
        #[serde(default)]
        skills: Option<String>,
        #[serde(default = "default_true")]
        inherit_context: bool,
    },
    SendMessageToAgent {
        target_agent_id: String,
        message: String,
    },
    WaitForMessage {
        #[serde(default)]
        reason: Option<String>,
    },
    AgentFinish {
        result_summary: String,
        #[serde(default = "default_true")]
        success: bool,
    },
    FinishScan {
        executive_summary: String,
        methodology: String,
        technical_analysis: String,
        recommendations: String,
    },
    ViewAgentGraph {},
    StopAgent {
        agent_id: String,
    },
    ReportVulnerability {
        title: String,
        severity: String,
        description: String,
    },
}

/// Tools executed by the sandbox worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum SandboxCommand {
    ShellExec {
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    FileRead {
        path: String,
    },
    FileWrite {
        path: String,
        content: String,
    },
    HttpRequest {
        url: String,
        #[serde(default)]
        method: Option<String>,
    },
}

impl SandboxCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SandboxCommand::ShellExec { .. } => "shell_exec",
            SandboxCommand::FileRead { .. } => "file_read",
            SandboxCommand::FileWrite { .. } => "file_write",
            SandboxCommand::HttpRequest { .. } => "http_request",
        }
    }

    /// Target URL for network-probing commands.
    pub fn network_target(&self) -> Option<&str> {
        match self {
            SandboxCommand::HttpRequest { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// A resolved invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCommand {
    Agent(AgentCommand),
    Sandbox(SandboxCommand),
}
