use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::pacer::PacerTuning;
use crate::sandbox::RetryPolicy;

/// The TOML file structure for agentmesh.toml.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    pub general: Option<GeneralConfig>,
    pub pacer: Option<PacerConfig>,
    pub sandbox: Option<SandboxConfig>,
    pub compactor: Option<CompactorConfig>,
    pub completion: Option<CompletionConfig>,
    pub scope: Option<ScopeConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GeneralConfig {
    pub model: Option<String>,
    pub workspace: Option<String>,
    pub max_iterations: Option<u64>,
    pub model_max_retries: Option<u32>,
    pub waiting_timeout_secs: Option<u64>,
    pub mailbox_capacity: Option<usize>,
    pub max_agents: Option<usize>,
    pub max_depth: Option<usize>,
    pub whitebox: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PacerConfig {
    pub max_inflight: Option<usize>,
    pub min_start_interval_ms: Option<u64>,
    pub start_jitter_ms: Option<u64>,
    pub rate_limit_cooldown_secs: Option<u64>,
    pub rate_limit_cooldown_max_secs: Option<u64>,
    pub wait_poll_interval_ms: Option<u64>,
    pub reload_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SandboxConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub execution_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    /// Control plane that provisions sandboxes on demand.
    pub cloud_api_base: Option<String>,
    pub cloud_api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CompactorConfig {
    pub summarize: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub threshold: Option<usize>,
    pub keep_recent: Option<usize>,
    pub brief_char_budget: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CompletionConfig {
    pub max_remediation_bounces: Option<u32>,
    pub remediation_marker: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ScopeConfig {
    /// Hosts network-probing tools may target. Empty allows everything.
    pub allowed_hosts: Option<Vec<String>>,
}

impl ConfigFile {
    /// Flatten the file's sections into a mergeable partial config.
    pub fn to_partial(self) -> PartialConfig {
        let general = self.general.unwrap_or_default();
        let pacer = self.pacer.unwrap_or_default();
        let sandbox = self.sandbox.unwrap_or_default();
        let compactor = self.compactor.unwrap_or_default();
        let completion = self.completion.unwrap_or_default();
        let scope = self.scope.unwrap_or_default();

        PartialConfig {
            model: general.model,
            workspace: general.workspace.map(PathBuf::from),
            max_iterations: general.max_iterations,
            model_max_retries: general.model_max_retries,
            waiting_timeout_secs: general.waiting_timeout_secs,
            mailbox_capacity: general.mailbox_capacity,
            max_agents: general.max_agents,
            max_depth: general.max_depth,
            whitebox: general.whitebox,
            max_inflight: pacer.max_inflight,
            min_start_interval_ms: pacer.min_start_interval_ms,
            start_jitter_ms: pacer.start_jitter_ms,
            rate_limit_cooldown_secs: pacer.rate_limit_cooldown_secs,
            rate_limit_cooldown_max_secs: pacer.rate_limit_cooldown_max_secs,
            wait_poll_interval_ms: pacer.wait_poll_interval_ms,
            reload_interval_secs: pacer.reload_interval_secs,
            sandbox_url: sandbox.url,
            sandbox_token: sandbox.token,
            execution_timeout_secs: sandbox.execution_timeout_secs,
            connect_timeout_secs: sandbox.connect_timeout_secs,
            max_retries: sandbox.max_retries,
            backoff_initial_ms: sandbox.backoff_initial_ms,
            backoff_max_ms: sandbox.backoff_max_ms,
            cloud_api_base: sandbox.cloud_api_base,
            cloud_api_key: sandbox.cloud_api_key,
            summarize: compactor.summarize,
            compactor_timeout_secs: compactor.timeout_secs,
            compaction_threshold: compactor.threshold,
            keep_recent: compactor.keep_recent,
            brief_char_budget: compactor.brief_char_budget,
            max_remediation_bounces: completion.max_remediation_bounces,
            remediation_marker: completion.remediation_marker,
            allowed_hosts: scope.allowed_hosts,
        }
    }
}

/// Sandbox endpoint, timeouts and caller-side retry policy.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Tool server base URL. `None` runs sandbox tools in-process.
    pub url: Option<String>,
    pub token: Option<String>,
    pub execution_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// When set, sandboxes are provisioned (and reprovisioned) through this
    /// control plane; `url`, if also set, is used until the first revival.
    pub cloud_api_base: Option<String>,
    pub cloud_api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactorSettings {
    /// Ask the model to summarize old context; otherwise use the brief rendering.
    pub summarize: bool,
    pub timeout: Duration,
    /// Histories longer than this are compacted.
    pub threshold: usize,
    /// Trailing messages always carried over verbatim.
    pub keep_recent: usize,
    /// Per-message character budget of the brief rendering.
    pub brief_char_budget: usize,
}

impl Default for CompactorSettings {
    fn default() -> Self {
        Self {
            summarize: true,
            timeout: Duration::from_secs(60),
            threshold: 15,
            keep_recent: 10,
            brief_char_budget: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub max_remediation_bounces: u32,
    /// Lowercase name fragment identifying remediation agents.
    pub remediation_marker: String,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            max_remediation_bounces: 2,
            remediation_marker: "fix".to_string(),
        }
    }
}

/// Fully-resolved runtime configuration. All fields have values.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub workspace: PathBuf,
    pub max_iterations: u64,
    pub model_max_retries: u32,
    pub waiting_timeout: Duration,
    pub mailbox_capacity: usize,
    pub max_agents: usize,
    pub max_depth: usize,
    pub whitebox: bool,
    pub pacer: PacerTuning,
    pub reload_interval: Duration,
    pub sandbox: SandboxSettings,
    pub compactor: CompactorSettings,
    pub completion: CompletionSettings,
    pub allowed_hosts: Vec<String>,
}

/// Partial config used during merge. All fields are Option so that
/// missing fields don't override lower-priority values.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub model: Option<String>,
    pub workspace: Option<PathBuf>,
    pub max_iterations: Option<u64>,
    pub model_max_retries: Option<u32>,
    pub waiting_timeout_secs: Option<u64>,
    pub mailbox_capacity: Option<usize>,
    pub max_agents: Option<usize>,
    pub max_depth: Option<usize>,
    pub whitebox: Option<bool>,
    pub max_inflight: Option<usize>,
    pub min_start_interval_ms: Option<u64>,
    pub start_jitter_ms: Option<u64>,
    pub rate_limit_cooldown_secs: Option<u64>,
    pub rate_limit_cooldown_max_secs: Option<u64>,
    pub wait_poll_interval_ms: Option<u64>,
    pub reload_interval_secs: Option<u64>,
    pub sandbox_url: Option<String>,
    pub sandbox_token: Option<String>,
    pub execution_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_initial_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub cloud_api_base: Option<String>,
    pub cloud_api_key: Option<String>,
    pub summarize: Option<bool>,
    pub compactor_timeout_secs: Option<u64>,
    pub compaction_threshold: Option<usize>,
    pub keep_recent: Option<usize>,
    pub brief_char_budget: Option<usize>,
    pub max_remediation_bounces: Option<u32>,
    pub remediation_marker: Option<String>,
    /// REPLACE semantics: a higher layer's list is used entirely.
    pub allowed_hosts: Option<Vec<String>>,
}
