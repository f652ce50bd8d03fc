use super::schema::{AppConfig, CompactorSettings, CompletionSettings, PartialConfig, SandboxSettings};
use crate::pacer::PacerTuning;
use crate::sandbox::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

impl PartialConfig {
    /// Merge self with a lower-priority fallback.
    /// Self's non-None values take precedence.
    /// For allowed_hosts: REPLACE semantics (if self has Some, use it entirely).
    pub fn with_fallback(self, fallback: PartialConfig) -> PartialConfig {
        PartialConfig {
            model: self.model.or(fallback.model),
            workspace: self.workspace.or(fallback.workspace),
            max_iterations: self.max_iterations.or(fallback.max_iterations),
            model_max_retries: self.model_max_retries.or(fallback.model_max_retries),
            waiting_timeout_secs: self.waiting_timeout_secs.or(fallback.waiting_timeout_secs),
            mailbox_capacity: self.mailbox_capacity.or(fallback.mailbox_capacity),
            max_agents: self.max_agents.or(fallback.max_agents),
            max_depth: self.max_depth.or(fallback.max_depth),
            whitebox: self.whitebox.or(fallback.whitebox),
            max_inflight: self.max_inflight.or(fallback.max_inflight),
            min_start_interval_ms: self.min_start_interval_ms.or(fallback.min_start_interval_ms),
            start_jitter_ms: self.start_jitter_ms.or(fallback.start_jitter_ms),
            rate_limit_cooldown_secs: self
                .rate_limit_cooldown_secs
                .or(fallback.rate_limit_cooldown_secs),
            rate_limit_cooldown_max_secs: self
                .rate_limit_cooldown_max_secs
                .or(fallback.rate_limit_cooldown_max_secs),
            wait_poll_interval_ms: self.wait_poll_interval_ms.or(fallback.wait_poll_interval_ms),
            reload_interval_secs: self.reload_interval_secs.or(fallback.reload_interval_secs),
            sandbox_url: self.sandbox_url.or(fallback.sandbox_url),
            sandbox_token: self.sandbox_token.or(fallback.sandbox_token),
            execution_timeout_secs: self
                .execution_timeout_secs
                .or(fallback.execution_timeout_secs),
            connect_timeout_secs: self.connect_timeout_secs.or(fallback.connect_timeout_secs),
            max_retries: self.max_retries.or(fallback.max_retries),
            backoff_initial_ms: self.backoff_initial_ms.or(fallback.backoff_initial_ms),
            backoff_max_ms: self.backoff_max_ms.or(fallback.backoff_max_ms),
            cloud_api_base: self.cloud_api_base.or(fallback.cloud_api_base),
            cloud_api_key: self.cloud_api_key.or(fallback.cloud_api_key),
            summarize: self.summarize.or(fallback.summarize),
            compactor_timeout_secs: self
                .compactor_timeout_secs
                .or(fallback.compactor_timeout_secs),
            compaction_threshold: self.compaction_threshold.or(fallback.compaction_threshold),
            keep_recent: self.keep_recent.or(fallback.keep_recent),
            brief_char_budget: self.brief_char_budget.or(fallback.brief_char_budget),
            max_remediation_bounces: self
                .max_remediation_bounces
                .or(fallback.max_remediation_bounces),
            remediation_marker: self.remediation_marker.or(fallback.remediation_marker),
            allowed_hosts: self.allowed_hosts.or(fallback.allowed_hosts),
        }
    }

    /// Convert to AppConfig, filling any remaining gaps with defaults.
    pub fn finalize(self) -> AppConfig {
        let pacer_defaults = PacerTuning::default();
        let retry_defaults = RetryPolicy::default();
        let compactor_defaults = CompactorSettings::default();
        let completion_defaults = CompletionSettings::default();

        let pacer = PacerTuning {
            max_inflight: self.max_inflight.unwrap_or(pacer_defaults.max_inflight),
            min_start_interval: self
                .min_start_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(pacer_defaults.min_start_interval),
            start_jitter: self
                .start_jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(pacer_defaults.start_jitter),
            rate_limit_cooldown: self
                .rate_limit_cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(pacer_defaults.rate_limit_cooldown),
            rate_limit_cooldown_max: self
                .rate_limit_cooldown_max_secs
                .map(Duration::from_secs)
                .unwrap_or(pacer_defaults.rate_limit_cooldown_max),
            wait_poll_interval: self
                .wait_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(pacer_defaults.wait_poll_interval),
        }
        .sanitized();

        let sandbox = SandboxSettings {
            url: self.sandbox_url,
            token: self.sandbox_token,
            execution_timeout: Duration::from_secs(self.execution_timeout_secs.unwrap_or(120)),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.unwrap_or(10)),
            retry: RetryPolicy {
                max_attempts: self.max_retries.unwrap_or(retry_defaults.max_attempts),
                initial_delay: self
                    .backoff_initial_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.initial_delay),
                max_delay: self
                    .backoff_max_ms
                    .map(Duration::from_millis)
                    .unwrap_or(retry_defaults.max_delay),
                ..retry_defaults
            },
            cloud_api_base: self.cloud_api_base,
            cloud_api_key: self.cloud_api_key,
        };

        let compactor = CompactorSettings {
            summarize: self.summarize.unwrap_or(compactor_defaults.summarize),
            timeout: self
                .compactor_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(compactor_defaults.timeout),
            threshold: self
                .compaction_threshold
                .unwrap_or(compactor_defaults.threshold),
            keep_recent: self.keep_recent.unwrap_or(compactor_defaults.keep_recent),
            brief_char_budget: self
                .brief_char_budget
                .unwrap_or(compactor_defaults.brief_char_budget),
        };

        let completion = CompletionSettings {
            max_remediation_bounces: self
                .max_remediation_bounces
                .unwrap_or(completion_defaults.max_remediation_bounces),
            remediation_marker: self
                .remediation_marker
                .map(|m| m.to_lowercase())
                .unwrap_or(completion_defaults.remediation_marker),
        };

        AppConfig {
            model: self
                .model
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            workspace: self
                .workspace
                .unwrap_or_else(|| PathBuf::from("./workspace")),
            max_iterations: self.max_iterations.unwrap_or(300),
            model_max_retries: self.model_max_retries.unwrap_or(5),
            waiting_timeout: Duration::from_secs(self.waiting_timeout_secs.unwrap_or(600)),
            mailbox_capacity: self.mailbox_capacity.unwrap_or(64),
            max_agents: self.max_agents.unwrap_or(50),
            max_depth: self.max_depth.unwrap_or(5),
            whitebox: self.whitebox.unwrap_or(false),
            pacer,
            reload_interval: Duration::from_secs(self.reload_interval_secs.unwrap_or(5)),
            sandbox,
            compactor,
            completion,
            allowed_hosts: self.allowed_hosts.unwrap_or_default(),
        }
    }
}
