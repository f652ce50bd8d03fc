use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use agentmesh::agent::{
    AgentRegistry, AgentStatus, ContextCompactor, LoopSettings, ModelSummarizer, Orchestrator,
    OrchestratorParts, RegistryLimits, RunOutcome, Summarizer,
};
use agentmesh::config::{CompactorSettings, CompletionSettings};
use agentmesh::error::ModelError;
use agentmesh::gate::CompletionGate;
use agentmesh::llm::{ModelClient, ModelRequest, ModelResponse};
use agentmesh::protocol::{DeclaredToolCall, Message};
use agentmesh::sandbox::{SandboxExecutor, SandboxWorker};
use agentmesh::scope::AllowAll;
use agentmesh::telemetry::{RunRecorder, Telemetry};

// ─── Scripted model ───────────────────────────────────────────────────

const SUMMARIZER: &str = "summarizer";

type Step = Result<ModelResponse, ModelError>;

/// Replies from per-agent scripts, keyed by the agent name found in the
/// system prompt. Requests without an agent identity go to the summarizer
/// script. Exhausted scripts fail every further call.
#[derive(Default)]
struct ScriptedModel {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    requests: Mutex<HashMap<String, Vec<ModelRequest>>>,
}

impl ScriptedModel {
    fn script(&self, agent: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(agent.to_string(), steps.into());
    }

    fn requests_for(&self, agent: &str) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap()
            .get(agent)
            .cloned()
            .unwrap_or_default()
    }
}

fn agent_key(request: &ModelRequest) -> String {
    request
        .system
        .lines()
        .find_map(|line| line.strip_prefix("- Name: "))
        .map(|name| name.trim().to_string())
        .unwrap_or_else(|| SUMMARIZER.to_string())
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let key = agent_key(&request);
        self.requests
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push(request);
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        step.unwrap_or_else(|| Err(ModelError::Request(format!("script for {key} exhausted"))))
    }
}

// ─── Helper ───────────────────────────────────────────────────────────

fn text(content: &str) -> Step {
    Ok(ModelResponse::text(content))
}

fn native(id: &str, name: &str, arguments: serde_json::Value) -> Step {
    native_with_text("", id, name, arguments)
}

fn native_with_text(content: &str, id: &str, name: &str, arguments: serde_json::Value) -> Step {
    Ok(ModelResponse {
        content: content.to_string(),
        tool_calls: vec![DeclaredToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
    })
}

fn finish_scan() -> Step {
    native(
        "call_finish",
        "finish_scan",
        json!({
            "executive_summary": "Done",
            "methodology": "Scripted",
            "technical_analysis": "Nothing notable",
            "recommendations": "None",
        }),
    )
}

fn settings(waiting_timeout: Duration) -> LoopSettings {
    LoopSettings {
        max_iterations: 50,
        model_max_retries: 1,
        model_retry_backoff: Duration::from_millis(10),
        waiting_timeout,
        whitebox: false,
    }
}

struct Harness {
    orchestrator: Orchestrator,
    recorder: Arc<RunRecorder>,
    model: Arc<ScriptedModel>,
    workspace: TempDir,
}

fn harness(model: ScriptedModel, settings: LoopSettings) -> Harness {
    let workspace = tempfile::tempdir().expect("failed to create temp dir");
    let model = Arc::new(model);
    let recorder = Arc::new(RunRecorder::in_memory());

    let worker = SandboxWorker::new(workspace.path(), Duration::from_secs(10)).unwrap();
    let executor = SandboxExecutor::in_process(worker, Duration::from_secs(10), Arc::new(AllowAll));
    let client: Arc<dyn ModelClient> = model.clone();
    let summarizer: Arc<dyn Summarizer> = Arc::new(ModelSummarizer::new(client.clone()));
    let telemetry: Arc<dyn Telemetry> = recorder.clone();

    let orchestrator = Orchestrator::new(OrchestratorParts {
        registry: AgentRegistry::new(RegistryLimits::default(), CancellationToken::new()),
        model: client,
        executor: Arc::new(executor),
        compactor: ContextCompactor::new(CompactorSettings::default(), Some(summarizer)),
        gate: CompletionGate::new(CompletionSettings::default(), settings.whitebox),
        telemetry,
        settings,
        operator_prompt: None,
    });

    Harness {
        orchestrator,
        recorder,
        model,
        workspace,
    }
}

fn run_in_background(orchestrator: &Orchestrator, task: &str) -> tokio::task::JoinHandle<RunOutcome> {
    let orchestrator = orchestrator.clone();
    let task = task.to_string();
    tokio::spawn(async move { orchestrator.run(&task).await.unwrap() })
}

/// Poll until `agent` (looked up by name) reaches `status`.
async fn wait_for_status(registry: &AgentRegistry, name: &str, status: AgentStatus) -> String {
    for _ in 0..200 {
        if let Some(node) = registry.nodes().into_iter().find(|n| n.name == name) {
            if node.status == status {
                return node.id;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{name} never reached {status}");
}

fn contents(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn assert_file(workspace: &Path, rel: &str, expected: &str) {
    assert_eq!(std::fs::read_to_string(workspace.join(rel)).unwrap(), expected);
}

// ============================================================
// Root delegates to a child and finishes the scan
// ============================================================

#[tokio::test]
async fn test_root_delegates_then_finishes() {
    let model = ScriptedModel::default();
    model.script(
        "Root Agent",
        vec![
            text(
                "Delegating.\n<function=create_agent>\n<parameter=name>Recon Agent</parameter>\n\
                 <parameter=task>Write findings to found.txt</parameter>\n\
                 <parameter=inherit_context>false</parameter>\n</function>",
            ),
            text("<function=wait_for_message>\n<parameter=reason>child running</parameter>\n</function>"),
            finish_scan(),
        ],
    );
    model.script(
        "Recon Agent",
        vec![
            // Give the root time to start waiting before the report lands.
            native("call_0", "shell_exec", json!({ "command": "sleep 0.5" })),
            native("call_1", "file_write", json!({ "path": "found.txt", "content": "sqli on /login" })),
            native("call_2", "agent_finish", json!({ "result_summary": "Found SQLi", "success": true })),
        ],
    );
    let h = harness(model, settings(Duration::from_secs(10)));

    let outcome = h.orchestrator.run("Assess the target").await.unwrap();

    assert!(outcome.succeeded(), "root ended as {:?}", outcome);
    assert_eq!(outcome.result.unwrap().summary, "Done");
    assert_file(h.workspace.path(), "found.txt", "sqli on /login");

    let nodes = h.orchestrator.registry().nodes();
    let child = nodes.iter().find(|n| n.name == "Recon Agent").unwrap();
    assert_eq!(child.status, AgentStatus::Finished);
    assert_eq!(child.parent_id.as_deref(), Some(outcome.root_id.as_str()));

    // The root's final turn saw the child's completion report.
    let root_requests = h.model.requests_for("Root Agent");
    let last = contents(&root_requests.last().unwrap().messages);
    assert!(last.contains("<agent_completion_report>"));
    assert!(last.contains("<status>FINISHED</status>"));
    assert!(last.contains("Found SQLi"));

    assert_eq!(h.recorder.scan_summary().unwrap().methodology, "Scripted");
}

#[tokio::test]
async fn test_text_only_reply_gets_a_nudge() {
    let model = ScriptedModel::default();
    model.script("Root Agent", vec![text("Thinking out loud."), finish_scan()]);
    let h = harness(model, settings(Duration::from_secs(5)));

    let outcome = h.orchestrator.run("task").await.unwrap();
    assert!(outcome.succeeded());

    let second = &h.model.requests_for("Root Agent")[1];
    let last = second.messages.last().unwrap();
    assert!(last.content.contains("without calling a tool"));
}

#[tokio::test]
async fn test_root_cannot_use_agent_finish() {
    let model = ScriptedModel::default();
    model.script(
        "Root Agent",
        vec![
            native("call_1", "agent_finish", json!({ "result_summary": "done" })),
            finish_scan(),
        ],
    );
    let h = harness(model, settings(Duration::from_secs(5)));

    let outcome = h.orchestrator.run("task").await.unwrap();
    assert!(outcome.succeeded());

    let second = &h.model.requests_for("Root Agent")[1];
    assert!(contents(&second.messages).contains("agent_finish_root"));
}

// ============================================================
// Model failure waits
// ============================================================

#[tokio::test]
async fn test_model_failure_wait_resumes_on_user_message() {
    let model = ScriptedModel::default();
    model.script(
        "Root Agent",
        vec![Err(ModelError::Request("provider down".into())), finish_scan()],
    );
    let h = harness(model, settings(Duration::from_secs(10)));

    let run = run_in_background(&h.orchestrator, "task");
    let root_id = wait_for_status(h.orchestrator.registry(), "Root Agent", AgentStatus::Waiting).await;
    h.orchestrator
        .post_user_message(&root_id, "provider is back, continue")
        .unwrap();

    let outcome = run.await.unwrap();
    assert!(outcome.succeeded());
    let last = h.model.requests_for("Root Agent").pop().unwrap();
    assert!(contents(&last.messages).contains("provider is back"));
}

#[tokio::test]
async fn test_model_failure_wait_times_out_into_failure() {
    let model = ScriptedModel::default();
    model.script("Root Agent", vec![Err(ModelError::Request("provider down".into()))]);
    let h = harness(model, settings(Duration::from_millis(300)));

    let outcome = h.orchestrator.run("task").await.unwrap();

    assert_eq!(outcome.status, AgentStatus::Failed);
    let error = outcome.result.unwrap().error.unwrap();
    assert!(error.contains("LLM request failed after 1 attempts"));
    assert!(error.contains("provider down"));
}

// ============================================================
// Stop requests
// ============================================================

#[tokio::test]
async fn test_stopped_child_reports_failure_to_parent() {
    let model = ScriptedModel::default();
    model.script(
        "Root Agent",
        vec![
            native(
                "call_1",
                "create_agent",
                json!({ "name": "Idle Agent", "task": "wait around", "inherit_context": false }),
            ),
            native("call_2", "wait_for_message", json!({})),
            finish_scan(),
        ],
    );
    model.script("Idle Agent", vec![native("call_1", "wait_for_message", json!({}))]);
    let h = harness(model, settings(Duration::from_secs(10)));

    let run = run_in_background(&h.orchestrator, "task");
    let child_id = wait_for_status(h.orchestrator.registry(), "Idle Agent", AgentStatus::Waiting).await;
    h.orchestrator.registry().request_stop(&child_id).unwrap();

    let outcome = run.await.unwrap();
    assert!(outcome.succeeded());

    let child = h.orchestrator.registry().snapshot(&child_id).unwrap();
    assert_eq!(child.status, AgentStatus::Failed);
    assert_eq!(child.result.unwrap().error.as_deref(), Some("agent stopped on request"));
}

// ============================================================
// Completion gate through the loop
// ============================================================

#[tokio::test]
async fn test_finish_scan_blocked_while_child_active() {
    let model = ScriptedModel::default();
    model.script(
        "Root Agent",
        vec![
            native(
                "call_1",
                "create_agent",
                json!({ "name": "Slow Agent", "task": "take a while", "inherit_context": false }),
            ),
            finish_scan(),
            native("call_2", "wait_for_message", json!({})),
            finish_scan(),
        ],
    );
    model.script(
        "Slow Agent",
        vec![
            native("call_1", "shell_exec", json!({ "command": "sleep 1" })),
            native("call_2", "agent_finish", json!({ "result_summary": "slow but done" })),
        ],
    );
    let h = harness(model, settings(Duration::from_secs(10)));

    let outcome = h.orchestrator.run("task").await.unwrap();
    assert!(outcome.succeeded());

    let third = &h.model.requests_for("Root Agent")[2];
    assert!(contents(&third.messages).contains("agents_still_active"));
}

// ============================================================
// Context inheritance
// ============================================================

#[tokio::test]
async fn test_long_parent_history_is_compacted_for_child() {
    let model = ScriptedModel::default();
    let mut root_steps: Vec<Step> = (0..10)
        .map(|i| {
            native_with_text(
                &format!("Reading missing-{i}.txt"),
                &format!("call_{i}"),
                "file_read",
                json!({ "path": format!("missing-{i}.txt") }),
            )
        })
        .collect();
    root_steps.push(native(
        "call_spawn",
        "create_agent",
        json!({ "name": "Heir Agent", "task": "continue the work" }),
    ));
    root_steps.push(native("call_wait", "wait_for_message", json!({})));
    root_steps.push(finish_scan());
    model.script("Root Agent", root_steps);
    model.script(SUMMARIZER, vec![text("SUMMARY OF EARLY WORK")]);
    model.script(
        "Heir Agent",
        vec![
            native("call_0", "shell_exec", json!({ "command": "sleep 0.5" })),
            native("call_1", "agent_finish", json!({ "result_summary": "inherited fine" })),
        ],
    );
    let h = harness(model, settings(Duration::from_secs(10)));

    let outcome = h.orchestrator.run("task").await.unwrap();
    assert!(outcome.succeeded());

    // 1 task message + 10 tool turns of 2 messages: 11 old, 10 recent.
    let summarizer_requests = h.model.requests_for(SUMMARIZER);
    assert_eq!(summarizer_requests.len(), 1);
    let transcript = contents(&summarizer_requests[0].messages);
    assert!(transcript.contains("missing-0.txt"));
    assert!(!transcript.contains("missing-9.txt"));

    let heir_first = contents(&h.model.requests_for("Heir Agent")[0].messages);
    assert!(heir_first.contains("<earlier_context_summary message_count=\"11\" source=\"summary\">"));
    assert!(heir_first.contains("SUMMARY OF EARLY WORK"));
    assert!(heir_first.contains("<recent_parent_activity>"));
    assert!(heir_first.contains("missing-9.txt"));
    assert!(heir_first.contains("continue the work"));
}
