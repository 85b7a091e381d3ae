//! Agent roster resolution and session naming.
//!
//! The policy lists agents by name and points each at a profile; the profile
//! decides which command the agent's session runs.

use std::collections::HashMap;

use crate::config::{AgentProfile, PolicyConfig, RunnerKind};
use crate::error::{OrchestratorError, Result};
use crate::model::AgentSpec;
use crate::plan::shell_quote;

/// Resolve `requested` agent names against the policy roster.
///
/// An empty request selects every policy agent in declaration order.
pub fn resolve_agents(policy: &PolicyConfig, requested: &[String]) -> Result<Vec<AgentSpec>> {
    let profiles: HashMap<&str, &AgentProfile> = policy
        .agent_profiles
        .iter()
        .map(|profile| (profile.name.trim(), profile))
        .collect();

    let spec_for = |name: &str, profile_name: &str| -> Result<AgentSpec> {
        let profile = profiles.get(profile_name.trim()).ok_or_else(|| {
            OrchestratorError::validation(format!(
                "agent {name:?} references unknown profile {profile_name:?}"
            ))
        })?;
        Ok(AgentSpec {
            name: name.to_string(),
            command: profile_command(profile),
        })
    };

    let wanted: Vec<&str> = requested
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect();

    if wanted.is_empty() {
        return policy
            .agents
            .iter()
            .map(|agent| spec_for(agent.name.trim(), &agent.profile))
            .collect();
    }

    wanted
        .into_iter()
        .map(|name| {
            let agent = policy
                .agents
                .iter()
                .find(|agent| agent.name.trim() == name)
                .ok_or_else(|| {
                    OrchestratorError::validation(format!(
                        "requested agent {name:?} not found in policy"
                    ))
                })?;
            spec_for(name, &agent.profile)
        })
        .collect()
}

/// Command line a profile's session runs.
pub fn profile_command(profile: &AgentProfile) -> String {
    match profile.runner {
        RunnerKind::Shell => profile
            .runner_options
            .command
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_string(),
        RunnerKind::Codex => {
            let prompt = profile.base_prompt.as_deref().unwrap_or("").trim();
            let mut command = String::from("codex exec");
            if profile.runner_options.full_auto {
                command.push_str(" --full-auto");
            }
            format!("{command} {}", shell_quote(prompt))
        }
    }
}

/// Render a tmux session name from `pattern`.
pub fn render_session_name(pattern: &str, agent: &str, workspace: &str) -> String {
    let name = pattern
        .replace("{agent}", &sanitize_token(agent))
        .replace("{workspace}", &sanitize_token(workspace));
    let name = name.trim();
    if name.is_empty() {
        "agent-workspace".to_string()
    } else {
        name.to_string()
    }
}

/// Lower-case `token` and fold characters tmux treats specially into `-`.
pub fn sanitize_token(token: &str) -> String {
    let mut out = String::new();
    for c in token.trim().to_lowercase().chars() {
        let mapped = match c {
            ' ' | '/' | '\\' | ':' | ',' | '.' | '@' | '#' | '[' | ']' | '{' | '}' | '(' | ')' => {
                '-'
            }
            other => other,
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyAgent, RunnerOptions};
    use proptest::prelude::*;

    fn policy_with_codex() -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.agent_profiles.push(AgentProfile {
            name: "coder".to_string(),
            runner: RunnerKind::Codex,
            base_prompt: Some("Fix the bug. Don't break things".to_string()),
            runner_options: RunnerOptions {
                command: None,
                full_auto: true,
            },
        });
        policy.agents.push(PolicyAgent {
            name: "implementer".to_string(),
            profile: "coder".to_string(),
        });
        policy
    }

    #[test]
    fn empty_request_selects_all_agents() {
        let agents = resolve_agents(&policy_with_codex(), &[]).unwrap();
        let names: Vec<_> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["agent", "implementer"]);
        assert_eq!(agents[0].command, "bash");
    }

    #[test]
    fn codex_profile_builds_quoted_prompt() {
        let agents = resolve_agents(&policy_with_codex(), &["implementer".to_string()]).unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(
            agents[0].command,
            "codex exec --full-auto 'Fix the bug. Don'\"'\"'t break things'"
        );
    }

    #[test]
    fn unknown_requested_agent_is_rejected() {
        let err = resolve_agents(&PolicyConfig::default(), &["ghost".to_string()]).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(err.to_string().contains("\"ghost\""));
    }

    #[test]
    fn blank_requests_fall_back_to_roster() {
        let agents = resolve_agents(&PolicyConfig::default(), &["  ".to_string()]).unwrap();
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn session_name_from_pattern() {
        assert_eq!(
            render_session_name("{agent}-{workspace}", "Agent", "METAWSM-001-20260101"),
            "agent-metawsm-001-20260101"
        );
        assert_eq!(
            render_session_name("mw:{agent}", "a/b c", "ws"),
            "mw:a-b-c"
        );
        assert_eq!(render_session_name("  ", "a", "b"), "agent-workspace");
    }

    #[test]
    fn sanitize_collapses_separators() {
        assert_eq!(sanitize_token("  Foo..Bar//baz  "), "foo-bar-baz");
        assert_eq!(sanitize_token("(())"), "x");
    }

    proptest! {
        #[test]
        fn sanitized_tokens_are_tmux_safe(token in ".{0,40}") {
            let out = sanitize_token(&token);
            prop_assert!(!out.is_empty());
            prop_assert!(!out.contains("--"));
            prop_assert!(!out.starts_with('-') && !out.ends_with('-'));
            prop_assert!(!out.contains(':') && !out.contains('.'));
        }
    }
}
