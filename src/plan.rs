//! Plan builder: turns a run spec into the ordered step list.
//!
//! The generated command text is a stable contract; dry runs print it
//! verbatim and resumed runs replay it from storage.

use chrono::{DateTime, Utc};

use crate::config::PolicyConfig;
use crate::model::{RunSpec, ShellAction, Step, StepKind, WorkspaceStrategy};

const RUN_TOKEN_MAX: usize = 14;

/// Build the plan for `spec`, numbering steps from 1.
///
/// Per ticket, in input order: verify the ticket, provision its workspace,
/// then start one session per roster agent.
pub fn build_plan(spec: &RunSpec, policy: &PolicyConfig) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut index = 1u32;
    let repo_csv = spec.repos.join(",");
    let prefix = policy.workspace.branch_prefix.as_str();

    for ticket in &spec.tickets {
        let workspace = workspace_name_for(ticket, &spec.run_id);

        steps.push(Step::pending(
            index,
            format!("verify-doc-ticket-{ticket}"),
            StepKind::Shell {
                command: format!("docmgr ticket list --ticket {}", shell_quote(ticket)),
                action: ShellAction::VerifyTicket,
            },
            ticket,
        ));
        index += 1;

        let command = match spec.workspace_strategy {
            WorkspaceStrategy::Create => format!(
                "wsm create {} --repos {} --branch {}",
                shell_quote(&workspace),
                shell_quote(&repo_csv),
                shell_quote(&format!("{prefix}/{workspace}")),
            ),
            WorkspaceStrategy::Fork => format!(
                "wsm fork {} --branch-prefix {}",
                shell_quote(&workspace),
                shell_quote(prefix),
            ),
            WorkspaceStrategy::Reuse => format!("wsm info {}", shell_quote(&workspace)),
        };
        steps.push(
            Step::pending(
                index,
                format!("workspace-{}-{workspace}", spec.workspace_strategy),
                StepKind::Shell {
                    command,
                    action: ShellAction::ProvisionWorkspace(spec.workspace_strategy),
                },
                ticket,
            )
            .with_workspace(&workspace),
        );
        index += 1;

        for agent in &spec.agents {
            steps.push(
                Step::pending(
                    index,
                    format!("tmux-start-{}-{workspace}", agent.name),
                    StepKind::TmuxStart {
                        agent: agent.name.clone(),
                    },
                    ticket,
                )
                .with_workspace(&workspace),
            );
            index += 1;
        }
    }

    steps
}

/// Deterministic workspace name: `{ticket-slug}-{run-token}`.
pub fn workspace_name_for(ticket: &str, run_id: &str) -> String {
    let ticket = ticket.trim().to_lowercase().replace(['/', ' '], "-");
    format!("{ticket}-{}", run_token(run_id))
}

fn run_token(run_id: &str) -> String {
    let lowered = run_id.trim().to_lowercase();
    let stripped = lowered.strip_prefix("run-").unwrap_or(&lowered);
    let mut token = stripped.replace(['/', ' ', ':'], "-");
    while token.contains("--") {
        token = token.replace("--", "-");
    }
    let token = token.trim_matches('-');
    if token.is_empty() {
        return "x".to_string();
    }
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= RUN_TOKEN_MAX {
        return token.to_string();
    }
    let tail: String = chars[chars.len() - RUN_TOKEN_MAX..].iter().collect();
    // A cut landing on a separator would leave a double hyphen in the name.
    tail.trim_start_matches('-').to_string()
}

/// Single-quote `value` for `sh`, escaping embedded quotes.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// Trim, drop a leading `origin/`, and default to `main`.
pub fn normalize_base_branch(branch: &str) -> String {
    let branch = branch.trim();
    let branch = branch.strip_prefix("origin/").unwrap_or(branch).trim();
    if branch.is_empty() {
        "main".to_string()
    } else {
        branch.to_string()
    }
}

/// `run-YYYYMMDD-HHMMSS` for `now`.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    format!("run-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Split values on commas, trim, and drop blanks and repeats, keeping first-seen order.
pub fn normalize_tokens(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values.iter().flat_map(|value| value.split(',')) {
        let value = value.trim();
        if value.is_empty() || out.iter().any(|seen| seen == value) {
            continue;
        }
        out.push(value.to_string());
    }
    out
}
