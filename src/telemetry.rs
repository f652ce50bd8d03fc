//! JSONL run recorder.
//!
//! Every run appends structured events to
//! `{workspace_parent}/.agentmesh-logs/run-{timestamp}.jsonl`, one JSON
//! object per line, flushed after each event. The recorder also keeps the
//! vulnerability reports and final scan fields in memory so the completion
//! gate can read counts without touching the file.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// A structured run event, tagged with `event_type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStart {
        model: String,
        workspace: String,
        task: String,
    },
    AgentCreated {
        agent_id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        task: String,
    },
    AgentStatus {
        agent_id: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ToolCall {
        agent_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        agent_id: String,
        tool: String,
        result: String,
    },
    Vulnerability {
        id: String,
        agent_id: String,
        title: String,
        severity: String,
        description: String,
    },
    ScanCompleted {
        executive_summary: String,
        methodology: String,
        technical_analysis: String,
        recommendations: String,
        vulnerability_count: usize,
    },
    RunEnd {
        outcome: String,
    },
}

#[derive(Serialize)]
struct Record<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a RunEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VulnerabilityReport {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub severity: String,
    pub description: String,
}

/// Final free-text fields persisted by `finish_scan`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ScanSummary {
    pub executive_summary: String,
    pub methodology: String,
    pub technical_analysis: String,
    pub recommendations: String,
}

/// Recorder collaborator read by the completion gate.
pub trait Telemetry: Send + Sync {
    fn record(&self, event: RunEvent);

    /// Store a vulnerability report and return its id.
    fn add_vulnerability(&self, agent_id: &str, title: &str, severity: &str, description: &str)
    -> String;

    fn vulnerability_count(&self) -> usize;

    fn record_scan_completion(&self, summary: ScanSummary);
}

#[derive(Default)]
struct RecorderState {
    writer: Option<BufWriter<fs::File>>,
    vulnerabilities: Vec<VulnerabilityReport>,
    scan: Option<ScanSummary>,
}

pub struct RunRecorder {
    state: Mutex<RecorderState>,
    log_path: Option<PathBuf>,
}

impl RunRecorder {
    /// Open a new run file next to `workspace`.
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let log_dir = Self::log_dir_for(workspace)?;
        fs::create_dir_all(&log_dir)?;

        let run_id = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
        let log_path = log_dir.join(format!("run-{run_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        Ok(Self {
            state: Mutex::new(RecorderState {
                writer: Some(BufWriter::new(file)),
                ..RecorderState::default()
            }),
            log_path: Some(log_path),
        })
    }

    /// A recorder that keeps state in memory and writes nothing.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(RecorderState::default()),
            log_path: None,
        }
    }

    fn log_dir_for(workspace: &Path) -> std::io::Result<PathBuf> {
        let absolute = if workspace.is_absolute() {
            workspace.to_path_buf()
        } else {
            std::env::current_dir()?.join(workspace)
        };
        let parent = absolute.parent().ok_or_else(|| {
            std::io::Error::other(format!(
                "workspace path '{}' has no parent directory",
                workspace.display()
            ))
        })?;
        Ok(parent.join(".agentmesh-logs"))
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn vulnerabilities(&self) -> Vec<VulnerabilityReport> {
        self.lock().vulnerabilities.clone()
    }

    pub fn scan_summary(&self) -> Option<ScanSummary> {
        self.lock().scan.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(state: &mut RecorderState, event: &RunEvent) {
        let Some(writer) = state.writer.as_mut() else {
            return;
        };
        let record = Record {
            timestamp: now_iso(),
            event,
        };
        if let Err(e) = write_line(writer, &record) {
            tracing::warn!(error = %e, "Failed to write run event");
        }
    }
}

fn write_line(writer: &mut BufWriter<fs::File>, record: &Record<'_>) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

impl Telemetry for RunRecorder {
    fn record(&self, event: RunEvent) {
        Self::write(&mut self.lock(), &event);
    }

    fn add_vulnerability(
        &self,
        agent_id: &str,
        title: &str,
        severity: &str,
        description: &str,
    ) -> String {
        let mut state = self.lock();
        let id = format!("vuln-{:04}", state.vulnerabilities.len() + 1);
        let report = VulnerabilityReport {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            title: title.trim().to_string(),
            severity: severity.trim().to_ascii_lowercase(),
            description: description.trim().to_string(),
        };
        let event = RunEvent::Vulnerability {
            id: report.id.clone(),
            agent_id: report.agent_id.clone(),
            title: report.title.clone(),
            severity: report.severity.clone(),
            description: report.description.clone(),
        };
        state.vulnerabilities.push(report);
        Self::write(&mut state, &event);
        id
    }

    fn vulnerability_count(&self) -> usize {
        self.lock().vulnerabilities.len()
    }

    fn record_scan_completion(&self, summary: ScanSummary) {
        let mut state = self.lock();
        let event = RunEvent::ScanCompleted {
            executive_summary: summary.executive_summary.clone(),
            methodology: summary.methodology.clone(),
            technical_analysis: summary.technical_analysis.clone(),
            recommendations: summary.recommendations.clone(),
            vulnerability_count: state.vulnerabilities.len(),
        };
        state.scan = Some(summary);
        Self::write(&mut state, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        let file = fs::File::open(path).unwrap();
        std::io::BufReader::new(file)
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn creates_log_file_in_sibling_dir() {
        let tmp = TempDir::new().unwrap();
        let recorder = RunRecorder::new(&tmp.path().join("workspace")).unwrap();
        let path = recorder.log_path().unwrap().to_owned();
        assert!(path.exists());
        assert!(path.starts_with(tmp.path().join(".agentmesh-logs")));
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("run-"));
    }

    #[test]
    fn events_are_tagged_and_timestamped() {
        let tmp = TempDir::new().unwrap();
        let recorder = RunRecorder::new(&tmp.path().join("workspace")).unwrap();
        recorder.record(RunEvent::AgentCreated {
            agent_id: "agent-1".into(),
            name: "Root".into(),
            parent_id: None,
            task: "scan".into(),
        });
        recorder.record(RunEvent::RunEnd {
            outcome: "finished".into(),
        });

        let lines = read_lines(recorder.log_path().unwrap());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_type"], "agent_created");
        assert_eq!(lines[0]["agent_id"], "agent-1");
        assert!(lines[0].get("parent_id").is_none());
        assert!(lines[0]["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(lines[1]["event_type"], "run_end");
    }

    #[test]
    fn vulnerabilities_get_sequential_ids() {
        let recorder = RunRecorder::in_memory();
        assert_eq!(recorder.add_vulnerability("a", "SQLi", "HIGH", "login form"), "vuln-0001");
        assert_eq!(recorder.add_vulnerability("a", "XSS", "low", "search"), "vuln-0002");
        assert_eq!(recorder.vulnerability_count(), 2);
        assert_eq!(recorder.vulnerabilities()[0].severity, "high");
    }

    #[test]
    fn scan_completion_is_persisted_with_count() {
        let tmp = TempDir::new().unwrap();
        let recorder = RunRecorder::new(&tmp.path().join("workspace")).unwrap();
        recorder.add_vulnerability("a", "SQLi", "high", "x");
        recorder.record_scan_completion(ScanSummary {
            executive_summary: "e".into(),
            methodology: "m".into(),
            technical_analysis: "t".into(),
            recommendations: "r".into(),
        });

        assert_eq!(recorder.scan_summary().unwrap().methodology, "m");
        let lines = read_lines(recorder.log_path().unwrap());
        let last = lines.last().unwrap();
        assert_eq!(last["event_type"], "scan_completed");
        assert_eq!(last["vulnerability_count"], 1);
    }
}
