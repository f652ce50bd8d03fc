//! Completion gate for `finish_scan`.
//!
//! Checks, in order: the caller is the root agent, no other agent is still
//! active, remediation coverage (whitebox runs only), and non-empty final
//! fields. Every rejection is a structured JSON observation for the model,
//! never an error.
//!
//! The remediation check bounces at most `max_remediation_bounces` times per
//! scan; after that it lets completion through with a warning so a scan can
//! never deadlock on unfixable findings.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde_json::{Value, json};

use crate::agent::registry::AgentRegistry;
use crate::agent::types::AgentId;
use crate::config::CompletionSettings;
use crate::telemetry::{ScanSummary, Telemetry};

const TASK_PREVIEW_CHARS: usize = 300;

/// Per-scan count of remediation rejections, keyed by root agent id.
#[derive(Debug, Default)]
pub struct BounceLedger {
    counts: Mutex<HashMap<AgentId, u32>>,
}

impl BounceLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, u32>> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Increment and return the count for `scan`.
    pub fn bump(&self, scan: &str) -> u32 {
        let mut counts = self.lock();
        let count = counts.entry(scan.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, scan: &str) -> u32 {
        self.lock().get(scan).copied().unwrap_or(0)
    }
}

/// Outcome of a `finish_scan` attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub completed: bool,
    /// Observation returned to the model.
    pub response: Value,
}

impl GateOutcome {
    fn rejected(response: Value) -> Self {
        Self {
            completed: false,
            response,
        }
    }
}

pub struct CompletionGate {
    settings: CompletionSettings,
    whitebox: bool,
    bounces: BounceLedger,
}

impl CompletionGate {
    pub fn new(settings: CompletionSettings, whitebox: bool) -> Self {
        Self {
            settings,
            whitebox,
            bounces: BounceLedger::default(),
        }
    }

    pub fn bounces(&self) -> &BounceLedger {
        &self.bounces
    }

    pub fn finish(
        &self,
        caller: &str,
        registry: &AgentRegistry,
        telemetry: &dyn Telemetry,
        summary: ScanSummary,
    ) -> GateOutcome {
        if let Some(rejection) = self.check_root(caller, registry) {
            return GateOutcome::rejected(rejection);
        }
        if let Some(rejection) = check_active_agents(caller, registry) {
            return GateOutcome::rejected(rejection);
        }
        if let Some(rejection) = self.check_remediation(caller, registry, telemetry) {
            return GateOutcome::rejected(rejection);
        }

        let mut errors = Vec::new();
        for (value, label) in [
            (&summary.executive_summary, "Executive summary"),
            (&summary.methodology, "Methodology"),
            (&summary.technical_analysis, "Technical analysis"),
            (&summary.recommendations, "Recommendations"),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{label} cannot be empty"));
            }
        }
        if !errors.is_empty() {
            return GateOutcome::rejected(json!({
                "success": false,
                "message": "Validation failed",
                "errors": errors,
            }));
        }

        telemetry.record_scan_completion(ScanSummary {
            executive_summary: summary.executive_summary.trim().to_string(),
            methodology: summary.methodology.trim().to_string(),
            technical_analysis: summary.technical_analysis.trim().to_string(),
            recommendations: summary.recommendations.trim().to_string(),
        });

        GateOutcome {
            completed: true,
            response: json!({
                "success": true,
                "scan_completed": true,
                "message": "Scan completed successfully",
                "vulnerabilities_found": telemetry.vulnerability_count(),
            }),
        }
    }

    fn check_root(&self, caller: &str, registry: &AgentRegistry) -> Option<Value> {
        let is_root = registry
            .snapshot(caller)
            .is_some_and(|node| node.parent_id.is_none());
        if is_root {
            return None;
        }
        Some(json!({
            "success": false,
            "error": "finish_scan_wrong_agent",
            "message": "This tool can only be used by the root/main agent",
            "suggestion": "If you are a subagent, use agent_finish instead",
        }))
    }

    fn check_remediation(
        &self,
        caller: &str,
        registry: &AgentRegistry,
        telemetry: &dyn Telemetry,
    ) -> Option<Value> {
        if !self.whitebox {
            return None;
        }
        let vuln_count = telemetry.vulnerability_count();
        if vuln_count == 0 {
            return None;
        }
        let fix_count = registry.count_finished_matching(&self.settings.remediation_marker);
        if fix_count >= vuln_count {
            return None;
        }

        let bounce = self.bounces.bump(caller);
        if bounce > self.settings.max_remediation_bounces {
            tracing::warn!(
                scan = caller,
                bounce,
                vulnerabilities = vuln_count,
                fixing_agents = fix_count,
                "Remediation bounce limit reached, allowing finish_scan"
            );
            return None;
        }

        let unfixed = vuln_count - fix_count;
        let detail = if fix_count == 0 {
            format!(
                "White-box scan has {vuln_count} reported vulnerabilities but no Fixing Agents \
                 have been spawned. In white-box mode, you MUST spawn Fixing Agents \
                 (skills=\"remediation,<vuln_type>\") to patch the vulnerable code before \
                 finishing the scan."
            )
        } else {
            format!(
                "White-box scan has {vuln_count} reported vulnerabilities but only {fix_count} \
                 Fixing Agent(s) completed. {unfixed} vulnerability(ies) may still be unpatched. \
                 Spawn additional Fixing Agents or call finish_scan again if the remaining \
                 issues are unfixable."
            )
        };

        Some(json!({
            "success": false,
            "error": "remediation_incomplete",
            "message": detail,
            "suggestions": [
                "Spawn a Fixing Agent: create_agent(name=\"<Vuln> Fixing Agent\", task=\"Fix <vuln> in <file>\", skills=\"remediation,<vuln_type>\")",
                "Each Fixing Agent should patch the code with file_write",
                "After all Fixing Agents complete, call finish_scan again",
            ],
            "vulnerabilities_reported": vuln_count,
            "fixing_agents_completed": fix_count,
            "vulnerabilities_without_fixes": unfixed,
        }))
    }
}

fn check_active_agents(caller: &str, registry: &AgentRegistry) -> Option<Value> {
    let active = registry.active_others(caller);
    if active.is_empty() {
        return None;
    }

    let mut status_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for node in &active {
        *status_counts.entry(node.status.as_str()).or_insert(0) += 1;
    }
    let agents: Vec<Value> = active
        .iter()
        .map(|node| {
            json!({
                "id": node.id,
                "name": node.name,
                "task": node.task.chars().take(TASK_PREVIEW_CHARS).collect::<String>(),
                "status": node.status,
            })
        })
        .collect();

    Some(json!({
        "success": false,
        "error": "agents_still_active",
        "message": "Cannot finish scan: agents are still active",
        "active_agents": agents,
        "status_counts": status_counts,
        "total_active": active.len(),
        "suggestions": [
            "Use wait_for_message to wait for all agents to complete",
            "Use send_message_to_agent if you need agents to complete immediately",
            "Use view_agent_graph to see current agent states",
        ],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::registry::RegistryLimits;
    use crate::telemetry::RunRecorder;
    use tokio_util::sync::CancellationToken;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(RegistryLimits::default(), CancellationToken::new())
    }

    fn summary() -> ScanSummary {
        ScanSummary {
            executive_summary: "exec".into(),
            methodology: "method".into(),
            technical_analysis: "analysis".into(),
            recommendations: "recs".into(),
        }
    }

    fn running_root(reg: &AgentRegistry) -> String {
        let root = reg.spawn(None, "Root", "scan", Vec::new()).unwrap();
        reg.start(&root.id).unwrap();
        root.id
    }

    fn finished_child(reg: &AgentRegistry, root: &str, name: &str) {
        let child = reg.spawn(Some(root), name, "t", Vec::new()).unwrap();
        reg.start(&child.id).unwrap();
        reg.finish(&child.id, "done").unwrap();
    }

    #[test]
    fn non_root_caller_is_redirected() {
        let reg = registry();
        let root = running_root(&reg);
        let child = reg.spawn(Some(root.as_str()), "Child", "t", Vec::new()).unwrap();
        let gate = CompletionGate::new(CompletionSettings::default(), false);

        let outcome = gate.finish(&child.id, &reg, &RunRecorder::in_memory(), summary());
        assert!(!outcome.completed);
        assert_eq!(outcome.response["error"], "finish_scan_wrong_agent");
    }

    #[test]
    fn active_children_block_with_detail() {
        let reg = registry();
        let root = running_root(&reg);
        let waiting = reg.spawn(Some(root.as_str()), "Waiter", &"t".repeat(400), Vec::new()).unwrap();
        reg.start(&waiting.id).unwrap();
        reg.enter_waiting(&waiting.id, false).unwrap();
        reg.spawn(Some(root.as_str()), "Queued", "q", Vec::new()).unwrap();
        finished_child(&reg, &root, "Done");

        let gate = CompletionGate::new(CompletionSettings::default(), false);
        let outcome = gate.finish(&root, &reg, &RunRecorder::in_memory(), summary());

        assert!(!outcome.completed);
        let r = &outcome.response;
        assert_eq!(r["error"], "agents_still_active");
        assert_eq!(r["total_active"], 2);
        assert_eq!(r["status_counts"]["waiting"], 1);
        assert_eq!(r["status_counts"]["queued"], 1);
        assert_eq!(r["active_agents"][0]["id"], waiting.id);
        assert_eq!(r["active_agents"][0]["task"].as_str().unwrap().len(), 300);
    }

    #[test]
    fn empty_fields_fail_validation() {
        let reg = registry();
        let root = running_root(&reg);
        let gate = CompletionGate::new(CompletionSettings::default(), false);
        let mut fields = summary();
        fields.methodology = "   ".into();

        let outcome = gate.finish(&root, &reg, &RunRecorder::in_memory(), fields);
        assert!(!outcome.completed);
        assert_eq!(outcome.response["errors"], json!(["Methodology cannot be empty"]));
    }

    #[test]
    fn success_persists_fields_and_reports_count() {
        let reg = registry();
        let root = running_root(&reg);
        let recorder = RunRecorder::in_memory();
        recorder.add_vulnerability(&root, "SQLi", "high", "x");
        let gate = CompletionGate::new(CompletionSettings::default(), false);

        let mut fields = summary();
        fields.executive_summary = "  padded  ".into();
        let outcome = gate.finish(&root, &reg, &recorder, fields);

        assert!(outcome.completed);
        assert_eq!(outcome.response["vulnerabilities_found"], 1);
        assert_eq!(recorder.scan_summary().unwrap().executive_summary, "padded");
    }

    #[test]
    fn whitebox_blocks_until_every_vulnerability_has_a_fix() {
        let reg = registry();
        let root = running_root(&reg);
        let recorder = RunRecorder::in_memory();
        for i in 0..3 {
            recorder.add_vulnerability(&root, &format!("v{i}"), "high", "d");
        }
        finished_child(&reg, &root, "SQLi Fixing Agent");
        let gate = CompletionGate::new(CompletionSettings::default(), true);

        let outcome = gate.finish(&root, &reg, &recorder, summary());
        assert!(!outcome.completed);
        assert_eq!(outcome.response["error"], "remediation_incomplete");
        assert_eq!(outcome.response["vulnerabilities_without_fixes"], 2);
        assert_eq!(outcome.response["fixing_agents_completed"], 1);

        finished_child(&reg, &root, "XSS Fixing Agent");
        finished_child(&reg, &root, "IDOR fix agent");
        let outcome = gate.finish(&root, &reg, &recorder, summary());
        assert!(outcome.completed);
    }

    #[test]
    fn remediation_check_is_off_outside_whitebox() {
        let reg = registry();
        let root = running_root(&reg);
        let recorder = RunRecorder::in_memory();
        recorder.add_vulnerability(&root, "v", "high", "d");
        let gate = CompletionGate::new(CompletionSettings::default(), false);
        assert!(gate.finish(&root, &reg, &recorder, summary()).completed);
    }

    #[test]
    fn fails_open_after_bounce_limit() {
        let reg = registry();
        let root = running_root(&reg);
        let recorder = RunRecorder::in_memory();
        recorder.add_vulnerability(&root, "v", "high", "d");
        let gate = CompletionGate::new(CompletionSettings::default(), true);

        assert!(!gate.finish(&root, &reg, &recorder, summary()).completed);
        assert!(!gate.finish(&root, &reg, &recorder, summary()).completed);
        assert!(gate.finish(&root, &reg, &recorder, summary()).completed);
        assert_eq!(gate.bounces().get(&root), 3);
    }

    #[test]
    fn exhausted_scan_does_not_release_another_scan() {
        let gate = CompletionGate::new(CompletionSettings::default(), true);

        let reg_a = registry();
        let root_a = running_root(&reg_a);
        let recorder_a = RunRecorder::in_memory();
        recorder_a.add_vulnerability(&root_a, "v", "high", "d");

        let reg_b = registry();
        let root_b = running_root(&reg_b);
        let recorder_b = RunRecorder::in_memory();
        recorder_b.add_vulnerability(&root_b, "v", "high", "d");

        assert!(!gate.finish(&root_a, &reg_a, &recorder_a, summary()).completed);
        assert!(!gate.finish(&root_a, &reg_a, &recorder_a, summary()).completed);
        assert!(gate.finish(&root_a, &reg_a, &recorder_a, summary()).completed);

        let outcome = gate.finish(&root_b, &reg_b, &recorder_b, summary());
        assert!(!outcome.completed);
        assert_eq!(outcome.response["error"], "remediation_incomplete");
        assert_eq!(gate.bounces().get(&root_a), 3);
        assert_eq!(gate.bounces().get(&root_b), 1);
    }

    #[test]
    fn bounce_ledger_is_per_scan() {
        let ledger = BounceLedger::default();
        ledger.bump("scan-a");
        ledger.bump("scan-a");
        ledger.bump("scan-a");
        assert_eq!(ledger.get("scan-a"), 3);
        assert_eq!(ledger.get("scan-b"), 0);
        assert_eq!(ledger.bump("scan-b"), 1);
    }
}
