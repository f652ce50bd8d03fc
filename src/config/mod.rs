pub mod live;
pub mod merge;
pub mod schema;

pub use live::LiveTuning;
pub use schema::*;

use crate::cli::{Cli, Commands};
use crate::error::ConfigError;
use crate::pacer::PacerTuning;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where configuration layers come from. Resolved once at startup so the
/// reload task re-reads exactly the same files.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    global_path: Option<PathBuf>,
    workspace_path: PathBuf,
    cli: PartialConfig,
}

impl ConfigSources {
    /// Resolve config file locations from CLI args.
    ///
    /// The workspace file is `<workspace>/agentmesh.toml` unless `--config`
    /// names a different file.
    pub fn from_cli(cli: &Cli) -> Self {
        let global_path = global_config_path();
        let global = global_path
            .as_deref()
            .map(load_toml_file)
            .unwrap_or_default();

        let workspace_dir = cli_workspace(cli)
            .or_else(|| global.workspace.clone())
            .unwrap_or_else(|| PathBuf::from("./workspace"));
        let workspace_path =
            cli_config_file(cli).unwrap_or_else(|| workspace_dir.join("agentmesh.toml"));

        Self {
            global_path,
            workspace_path,
            cli: cli_to_partial(cli),
        }
    }

    /// Merge: CLI > workspace > global > defaults.
    pub fn load(&self) -> AppConfig {
        let global = self
            .global_path
            .as_deref()
            .map(load_toml_file)
            .unwrap_or_default();
        let workspace = load_toml_file(&self.workspace_path);

        self.cli
            .clone()
            .with_fallback(workspace)
            .with_fallback(global)
            .finalize()
    }
}

/// Load configuration by merging global, workspace, and CLI sources.
/// Precedence: CLI > workspace config > global config > defaults.
///
/// Missing config files are handled gracefully (defaults apply).
pub fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let config = ConfigSources::from_cli(cli).load();
    validate(&config)?;
    Ok(config)
}

/// Reject combinations the runtime cannot work with.
pub fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let invalid = |key: &str, message: &str| {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        })
    };

    if config.compactor.threshold == 0 {
        return invalid("compactor.threshold", "must be at least 1");
    }
    if config.compactor.keep_recent > config.compactor.threshold {
        return invalid("compactor.keep_recent", "must not exceed compactor.threshold");
    }
    if config.mailbox_capacity == 0 {
        return invalid("general.mailbox_capacity", "must be at least 1");
    }
    if config.max_agents == 0 {
        return invalid("general.max_agents", "must be at least 1");
    }
    if config.sandbox.url.is_some() && config.sandbox.token.is_none() {
        return invalid("sandbox.token", "required when sandbox.url is set");
    }
    if config.sandbox.cloud_api_base.is_some() && config.sandbox.cloud_api_key.is_none() {
        return invalid("sandbox.cloud_api_key", "required when sandbox.cloud_api_base is set");
    }
    Ok(())
}

/// Periodically re-read the config files and publish new pacer tunables.
pub fn spawn_tuning_reload(
    sources: ConfigSources,
    tuning: LiveTuning<PacerTuning>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let fresh = sources.load().pacer;
                    if tuning.publish(fresh.clone()) {
                        tracing::info!(
                            max_inflight = fresh.max_inflight,
                            min_start_interval_ms = fresh.min_start_interval.as_millis() as u64,
                            "Pacer tuning reloaded"
                        );
                    }
                }
            }
        }
    })
}

/// Load and parse a TOML config file into a PartialConfig.
/// Returns an empty PartialConfig on file-not-found; parse errors are logged.
fn load_toml_file(path: &Path) -> PartialConfig {
    match read_toml_file(path) {
        Ok(Some(partial)) => {
            tracing::debug!("Loaded config from {}", path.display());
            partial
        }
        Ok(None) => {
            tracing::debug!("No config file at {}, using defaults", path.display());
            PartialConfig::default()
        }
        Err(e) => {
            tracing::warn!("Config error: {e}");
            PartialConfig::default()
        }
    }
}

fn read_toml_file(path: &Path) -> Result<Option<PartialConfig>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let file = toml::from_str::<ConfigFile>(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(Some(file.to_partial()))
}

/// Resolve the platform-specific global config path.
/// Linux: ~/.config/agentmesh/agentmesh.toml
/// macOS: ~/Library/Application Support/agentmesh/agentmesh.toml
fn global_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "agentmesh")
        .map(|dirs| dirs.config_dir().join("agentmesh.toml"))
}

fn cli_workspace(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Run { workspace, .. } => workspace.clone(),
        Commands::Sandbox { workspace, .. } => workspace.clone(),
    }
}

fn cli_config_file(cli: &Cli) -> Option<PathBuf> {
    match &cli.command {
        Commands::Run { config, .. } => config.clone(),
        Commands::Sandbox { config, .. } => config.clone(),
    }
}

/// Convert CLI arguments to a PartialConfig for merging.
fn cli_to_partial(cli: &Cli) -> PartialConfig {
    match &cli.command {
        Commands::Run {
            model,
            workspace,
            whitebox,
            sandbox_url,
            sandbox_token,
            ..
        } => PartialConfig {
            model: model.clone(),
            workspace: workspace.clone(),
            whitebox: whitebox.then_some(true),
            sandbox_url: sandbox_url.clone(),
            sandbox_token: sandbox_token.clone(),
            ..Default::default()
        },
        Commands::Sandbox {
            workspace, timeout, ..
        } => PartialConfig {
            workspace: workspace.clone(),
            execution_timeout_secs: *timeout,
            ..Default::default()
        },
    }
}
