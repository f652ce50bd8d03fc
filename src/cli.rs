use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "agentmesh",
    version,
    about = "Autonomous multi-agent orchestration engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a root agent on a task until it finishes the scan
    Run {
        /// Task given to the root agent
        #[arg(short, long)]
        task: String,

        /// Model name (e.g., "claude-sonnet-4-5", "gpt-4o", "llama3.2")
        #[arg(short, long)]
        model: Option<String>,

        /// Workspace directory path
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Path to config file (replaces the workspace config file)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Require remediation agents for every reported vulnerability
        #[arg(long)]
        whitebox: bool,

        /// Base URL of a sandbox tool server; tools run in-process when absent
        #[arg(long)]
        sandbox_url: Option<String>,

        /// Bearer token for the sandbox tool server
        #[arg(long)]
        sandbox_token: Option<String>,
    },
    /// Serve sandbox-bound tools over HTTP
    Sandbox {
        /// Bearer token callers must present
        #[arg(long)]
        token: String,

        /// Port to listen on
        #[arg(short, long, default_value_t = 48081)]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Hard per-call timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Directory the tools operate in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Path to config file (replaces the workspace config file)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
