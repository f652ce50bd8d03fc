pub mod agent_loop;
pub mod compactor;
pub mod registry;
pub mod state;
pub mod supervisor;
pub mod system_prompt;
pub mod toolbox;
pub mod types;

pub use agent_loop::AgentExit;
pub use compactor::{ContextCompactor, InheritedContext, ModelSummarizer, Summarizer, SummaryOutcome};
pub use registry::{AgentRegistry, Mailbox, RegistryLimits, SpawnedAgent};
pub use state::AgentState;
pub use supervisor::{LoopSettings, Orchestrator, OrchestratorParts, RunOutcome};
pub use types::{AgentId, AgentNode, AgentResult, AgentStatus, MessageSender, WaitReason};
