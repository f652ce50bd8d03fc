use std::path::PathBuf;
use std::time::Duration;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid config value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },
}

/// State-machine and structural violations raised by the agent registry.
///
/// These are structured rejections, not crashes: callers turn them into
/// observations for the model or into a `failed` transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    UnknownAgent(String),

    #[error("parent agent not found: {0}")]
    ParentNotFound(String),

    #[error("a root agent already exists: {0}")]
    RootAlreadyExists(String),

    #[error("invalid transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: String,
        to: String,
    },

    #[error("max total agents reached ({current}/{max})")]
    TooManyAgents { current: usize, max: usize },

    #[error("max nesting depth exceeded ({depth} > {max})")]
    TooDeep { depth: usize, max: usize },

    #[error("mailbox of agent {0} is full")]
    MailboxFull(String),

    #[error("mailbox of agent {0} is closed")]
    MailboxClosed(String),
}

/// Errors surfaced by a tool invocation. Every variant is rendered into an
/// observation string for the model; none of them stops the agent loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Invalid arguments for '{tool}': {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool timed out after {0}s")]
    Timeout(u64),

    #[error("Tool execution cancelled")]
    Cancelled,

    #[error("Tool execution error: {0}")]
    Execution(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Target out of scope: {0}")]
    OutOfScope(String),
}

/// Transport-level failures talking to a sandbox worker.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox unreachable: {0}")]
    Network(String),

    #[error("sandbox rejected credentials")]
    Unauthorized,

    #[error("sandbox returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("sandbox revival failed: {0}")]
    Revive(String),

    #[error("sandbox call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Errors from an outbound model call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("rate limited by provider: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM error: {0}")]
    Request(String),
}

/// Terminal errors of an agent loop. Each becomes a `failed` transition.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("LLM request failed after {attempts} attempts: {last}")]
    ModelExhausted { attempts: u32, last: String },

    #[error("no resuming message within {0:?}")]
    WaitingTimedOut(Duration),

    #[error("iteration limit reached ({0})")]
    MaxIterations(u64),

    #[error("agent stopped on request")]
    Stopped,

    #[error("mailbox closed")]
    MailboxClosed,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}
