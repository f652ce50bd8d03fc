//! System prompt assembly.
//!
//! Every agent gets the same harness preamble (identity, position in the
//! agent graph, tool listing, coordination rules). Operators can append
//! their own instructions through an optional `SYSTEM_PROMPT.md` in the
//! workspace directory, read once at startup.

use std::path::Path;

use crate::tools::tool_descriptions;

/// Identity and mode of the agent the prompt is built for.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub agent_id: &'a str,
    pub name: &'a str,
    pub parent_id: Option<&'a str>,
    pub skills: &'a [String],
    pub whitebox: bool,
    pub operator_prompt: Option<&'a str>,
}

/// Read `SYSTEM_PROMPT.md` from the workspace, if present and non-empty.
pub async fn load_operator_prompt(workspace: &Path) -> Option<String> {
    let path = workspace.join("SYSTEM_PROMPT.md");
    match tokio::fs::read_to_string(&path).await {
        Ok(content) if !content.trim().is_empty() => {
            tracing::debug!(path = %path.display(), "Loaded operator prompt");
            Some(content)
        }
        Ok(_) => None,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read operator prompt");
            None
        }
    }
}

pub fn build_system_prompt(ctx: &PromptContext<'_>) -> String {
    let role = match ctx.parent_id {
        None => "You are the ROOT agent. You coordinate the run: split the work into \
                 sub-tasks, spawn child agents with create_agent, collect their \
                 completion reports, and end the run with finish_scan once every \
                 child has finished."
            .to_string(),
        Some(parent) => format!(
            "You are a SUB-AGENT spawned by agent {parent}. Work only on your task. \
             When done, call agent_finish with a concise summary; your parent \
             receives it as a completion report."
        ),
    };

    let skills = if ctx.skills.is_empty() {
        String::new()
    } else {
        format!("\n- Skills: {}", ctx.skills.join(", "))
    };

    let remediation = if ctx.whitebox {
        "\n- White-box mode: every reported vulnerability needs a Fixing Agent \
         (name containing \"Fix\") that patches the code before finish_scan succeeds."
    } else {
        ""
    };

    let mut prompt = format!(
        "\
You are an autonomous agent in a multi-agent orchestration run.

## Identity
- Name: {name}
- Agent ID: {agent_id}{skills}

## Role
{role}

## Available Tools
{tools}
Call tools either natively or with the tag form:
<function=tool_name>
<parameter=key>value</parameter>
</function>

## Coordination Rules
- Messages from other agents arrive as <inter_agent_message> blocks.
- Child results arrive as <agent_completion_report> blocks.
- Use wait_for_message when you have nothing to do until another agent reports.
- Always end your work with a tool call; plain text does not finish the task.{remediation}
",
        name = ctx.name,
        agent_id = ctx.agent_id,
        tools = tool_descriptions(),
    );

    if let Some(operator) = ctx.operator_prompt {
        prompt.push_str("\n## Operator Instructions\n\n---\n\n");
        prompt.push_str(operator.trim());
        prompt.push('\n');
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ctx<'a>(parent_id: Option<&'a str>, skills: &'a [String]) -> PromptContext<'a> {
        PromptContext {
            agent_id: "agent_1234abcd",
            name: "Recon",
            parent_id,
            skills,
            whitebox: false,
            operator_prompt: None,
        }
    }

    #[test]
    fn root_prompt_points_at_finish_scan() {
        let prompt = build_system_prompt(&ctx(None, &[]));
        assert!(prompt.contains("ROOT agent"));
        assert!(prompt.contains("finish_scan"));
        assert!(prompt.contains("agent_1234abcd"));
        assert!(!prompt.contains("Skills:"));
    }

    #[test]
    fn child_prompt_names_parent_and_skills() {
        let skills = vec!["recon".to_string(), "xss".to_string()];
        let prompt = build_system_prompt(&ctx(Some("agent_root0000"), &skills));
        assert!(prompt.contains("spawned by agent agent_root0000"));
        assert!(prompt.contains("- Skills: recon, xss"));
        assert!(prompt.contains("### create_agent"));
    }

    #[test]
    fn operator_prompt_is_appended() {
        let mut c = ctx(None, &[]);
        c.operator_prompt = Some("Stay polite.\n");
        c.whitebox = true;
        let prompt = build_system_prompt(&c);
        assert!(prompt.contains("White-box mode"));
        assert!(prompt.trim_end().ends_with("Stay polite."));
    }

    #[tokio::test]
    async fn operator_prompt_is_optional() {
        let tmp = TempDir::new().unwrap();
        assert!(load_operator_prompt(tmp.path()).await.is_none());

        std::fs::write(tmp.path().join("SYSTEM_PROMPT.md"), "Focus on auth.").unwrap();
        assert_eq!(
            load_operator_prompt(tmp.path()).await.as_deref(),
            Some("Focus on auth.")
        );
    }
}
