use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use agentmesh::agent::system_prompt::load_operator_prompt;
use agentmesh::agent::{
    AgentRegistry, ContextCompactor, LoopSettings, ModelSummarizer, Orchestrator,
    OrchestratorParts, RegistryLimits, Summarizer,
};
use agentmesh::cli::{self, Commands};
use agentmesh::config::{self, AppConfig, ConfigSources, LiveTuning};
use agentmesh::gate::CompletionGate;
use agentmesh::llm::{GenaiModelClient, ModelClient, PacedModelClient};
use agentmesh::pacer::RequestPacer;
use agentmesh::sandbox::{SandboxClient, SandboxExecutor, SandboxWorker, ToolServerState};
use agentmesh::scope::{HostAllowlist, ScopePolicy};
use agentmesh::telemetry::{RunEvent, RunRecorder, Telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = cli::Cli::parse();
    tracing::info!("agentmesh starting");

    let config = config::load_config(&cli)?;
    tracing::info!(model = %config.model, workspace = %config.workspace.display(), "Config loaded");

    match &cli.command {
        Commands::Run { task, .. } => run(&cli, config, task).await,
        Commands::Sandbox {
            token, port, host, ..
        } => {
            // `--timeout` is already folded into the merged config.
            let timeout = config.sandbox.execution_timeout;
            serve_sandbox(&config, token, host, *port, timeout).await
        }
    }
}

async fn run(cli: &cli::Cli, config: AppConfig, task: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.workspace).with_context(|| {
        format!("failed to create workspace {}", config.workspace.display())
    })?;

    let shutdown = CancellationToken::new();

    // Pacer tunables are re-read from the config files while the run is live.
    let tuning = LiveTuning::new(config.pacer.clone());
    let reload = config::spawn_tuning_reload(
        ConfigSources::from_cli(cli),
        tuning.clone(),
        config.reload_interval,
        shutdown.child_token(),
    );
    let pacer = Arc::new(RequestPacer::new(tuning));

    let raw_model: Arc<dyn ModelClient> = Arc::new(GenaiModelClient::new(&config.model));
    let model: Arc<dyn ModelClient> = Arc::new(PacedModelClient::new(raw_model, pacer));

    let scope: Arc<dyn ScopePolicy> =
        Arc::new(HostAllowlist::new(config.allowed_hosts.iter().map(String::as_str)));
    let executor = Arc::new(build_executor(&config, scope).await?);

    let recorder = Arc::new(RunRecorder::new(&config.workspace)?);
    if let Some(path) = recorder.log_path() {
        tracing::info!(log = %path.display(), "Run log opened");
    }
    let telemetry: Arc<dyn Telemetry> = recorder;
    telemetry.record(RunEvent::RunStart {
        model: config.model.clone(),
        workspace: config.workspace.display().to_string(),
        task: task.to_string(),
    });

    let summarizer: Arc<dyn Summarizer> = Arc::new(ModelSummarizer::new(model.clone()));
    let registry = AgentRegistry::new(
        RegistryLimits {
            max_agents: config.max_agents,
            max_depth: config.max_depth,
            mailbox_capacity: config.mailbox_capacity,
        },
        shutdown.child_token(),
    );

    let orchestrator = Orchestrator::new(OrchestratorParts {
        registry,
        model,
        executor,
        compactor: ContextCompactor::new(config.compactor.clone(), Some(summarizer)),
        gate: CompletionGate::new(config.completion.clone(), config.whitebox),
        telemetry,
        settings: LoopSettings::from_config(&config),
        operator_prompt: load_operator_prompt(&config.workspace).await,
    });

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; stopping all agents");
                orchestrator.registry().shutdown_all();
            }
        });
    }

    let outcome = orchestrator.run(task).await;
    shutdown.cancel();
    if let Err(e) = reload.await {
        tracing::debug!(error = %e, "Tuning reload task ended abnormally");
    }

    let outcome = outcome?;
    let summary = outcome
        .result
        .as_ref()
        .map(|r| r.summary.as_str())
        .unwrap_or("");
    println!(
        "Run {} ({}): {}",
        outcome.status, outcome.root_id, summary
    );
    if !outcome.succeeded() {
        anyhow::bail!("root agent ended with status {}", outcome.status);
    }
    Ok(())
}

async fn build_executor(
    config: &AppConfig,
    scope: Arc<dyn ScopePolicy>,
) -> anyhow::Result<SandboxExecutor> {
    let sandbox = &config.sandbox;
    let remote = SandboxClient::from_settings(sandbox)
        .await
        .context("failed to reach sandbox")?;
    match remote {
        Some(client) => {
            tracing::info!(
                url = %client.endpoint().base_url,
                cloud = sandbox.cloud_api_base.is_some(),
                "Using remote sandbox"
            );
            Ok(SandboxExecutor::remote(client, scope))
        }
        None => {
            let worker = SandboxWorker::new(&config.workspace, sandbox.execution_timeout)
                .context("failed to prepare sandbox workspace")?;
            tracing::info!(workspace = %config.workspace.display(), "Running sandbox tools in-process");
            Ok(SandboxExecutor::in_process(worker, sandbox.execution_timeout, scope))
        }
    }
}

async fn serve_sandbox(
    config: &AppConfig,
    token: &str,
    host: &str,
    port: u16,
    timeout: Duration,
) -> anyhow::Result<()> {
    let worker = SandboxWorker::new(&config.workspace, timeout)
        .context("failed to prepare sandbox workspace")?;
    let state = ToolServerState::new(token, worker, timeout);

    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    tracing::info!(address = %listener.local_addr()?, timeout_secs = timeout.as_secs(), "Sandbox tool server listening");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    agentmesh::sandbox::server::serve(listener, state, shutdown).await?;
    tracing::info!("Sandbox tool server stopped");
    Ok(())
}
