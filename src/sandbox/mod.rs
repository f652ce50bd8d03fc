//! Sandbox-bound tool execution: the worker and its HTTP tool server, the
//! RPC client with retry and revival, and the executor agents call.

pub mod client;
pub mod executor;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod shell;
pub mod worker;

pub use client::SandboxClient;
pub use executor::SandboxExecutor;
pub use retry::RetryPolicy;
pub use runtime::{CloudRuntime, SandboxEndpoint, SandboxRuntime, StaticRuntime};
pub use server::{BUSY_ERROR, ToolServerState};
pub use shell::{ExecResult, execute_shell};
pub use worker::SandboxWorker;
