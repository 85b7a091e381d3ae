mod cli;
mod shell_completion;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Input;
use tracing::{debug, info};

use cli::{BriefArgs, Cli, Command, RunArgs, RunSelector};
use metawsm::config::{PolicyConfig, default_db_path, write_default_policy};
use metawsm::git::GitCli;
use metawsm::model::{IntakeQa, RunMode, Step};
use metawsm::orchestrator::{
    ActionReport, BriefInput, CleanupOptions, CloseOptions, RestartOptions, RunOptions, RunResult,
};
use metawsm::shell::ShellRunner;
use metawsm::store::SqliteStore;
use metawsm::tmux::TmuxRunner;
use metawsm::workspace::WorkspaceRegistry;
use metawsm::{Orchestrator, Ports};

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn render_steps(output: &mut String, steps: &[Step]) {
    for step in steps {
        output.push_str(&format!(
            "  [{:>2}] {:<9} {:<10} {}\n",
            step.index,
            step.status,
            step.kind.label(),
            step.name
        ));
    }
}

fn render_run_result(result: &RunResult) -> String {
    let mut output = String::new();
    output.push_str("Run\n");
    push_kv(&mut output, "id", &result.run_id);
    push_kv(&mut output, "status", result.status);
    output.push_str("\nSteps\n");
    render_steps(&mut output, &result.steps);
    output
}

fn render_actions(report: &ActionReport) -> String {
    let mut output = String::new();
    let label = if report.dry_run { " (dry run)" } else { "" };
    output.push_str(&format!("Actions for {}{label}\n", report.run_id));
    if report.actions.is_empty() {
        output.push_str("  (none)\n");
    }
    for action in &report.actions {
        output.push_str(&format!("  {action}\n"));
    }
    output
}

fn run_options(args: RunArgs, mode: RunMode, brief: Option<BriefInput>) -> RunOptions {
    RunOptions {
        run_id: args.run_id,
        mode: Some(mode),
        tickets: args.tickets,
        repos: args.repos,
        workspace_strategy: args.strategy.map(Into::into),
        base_branch: args.base_branch,
        agents: args.agents,
        brief,
        dry_run: args.dry_run,
    }
}

/// Fill missing brief fields from flags or, unless disabled, terminal prompts.
fn collect_brief(args: BriefArgs) -> Result<BriefInput> {
    let interactive = !args.no_interactive;
    let mut qa = Vec::new();
    let mut field = |value: Option<String>, name: &str, question: &str| -> Result<String> {
        let answer = match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            Some(answer) => answer,
            None if !interactive => {
                bail!("missing required bootstrap intake field {name:?}");
            }
            None => Input::<String>::new()
                .with_prompt(question)
                .interact_text()
                .with_context(|| format!("failed to read {name}"))?,
        };
        qa.push(IntakeQa {
            question: question.to_string(),
            answer: answer.clone(),
        });
        Ok(answer)
    };

    let goal = field(args.goal, "goal", "Goal")?;
    let scope = field(args.scope, "scope", "Scope")?;
    let done_criteria = field(args.done_criteria, "done_criteria", "Done criteria")?;
    let constraints = field(args.constraints, "constraints", "Constraints")?;
    let merge_intent = match args.merge_intent.filter(|v| !v.trim().is_empty()) {
        Some(intent) => intent,
        None if interactive => Input::<String>::new()
            .with_prompt("Merge intent")
            .default("default".to_string())
            .interact_text()
            .context("failed to read merge_intent")?,
        None => String::new(),
    };

    Ok(BriefInput {
        goal,
        scope,
        done_criteria,
        constraints,
        merge_intent,
        qa,
    })
}

fn load_policy(explicit: Option<&Path>, cwd: &Path) -> Result<PolicyConfig> {
    if let Some(path) = explicit {
        let policy = PolicyConfig::load_file(path)?;
        info!("loaded policy from {}", path.display());
        return Ok(policy);
    }
    let (policy, path) = PolicyConfig::load(cwd)?;
    match path {
        Some(p) => info!("loaded policy from {}", p.display()),
        None => debug!("no .metawsm/policy.toml found, using defaults"),
    }
    Ok(policy)
}

fn open_orchestrator(
    policy: PolicyConfig,
    db_path: &Path,
    cancel: Arc<AtomicBool>,
) -> Result<Orchestrator> {
    let store = SqliteStore::open(db_path)?;
    let ports = Ports {
        store: Box::new(store),
        sessions: Box::new(TmuxRunner),
        commands: Box::new(ShellRunner),
        workspaces: Box::new(WorkspaceRegistry::from_env()?),
        git: Box::new(GitCli),
    };
    Ok(Orchestrator::new(policy, ports).with_cancel_flag(cancel))
}

fn selected(orchestrator: &Orchestrator, selector: &RunSelector) -> Result<String> {
    Ok(orchestrator.resolve_run_id(selector.run_id.as_deref(), selector.ticket.as_deref())?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "metawsm=info",
        1 => "metawsm=debug",
        _ => "metawsm=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;

    match cli.command {
        Command::PolicyInit => {
            let path = write_default_policy(&cwd)?;
            println!("wrote {}", path.display());
            return Ok(());
        }
        Command::Completions { shell } => {
            shell_completion::print(shell);
            return Ok(());
        }
        _ => {}
    }

    let policy = load_policy(cli.policy.as_deref(), &cwd)?;
    let db_path: PathBuf = cli.db.clone().unwrap_or_else(|| default_db_path(&cwd));
    debug!(db = %db_path.display(), "opening run store");

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_clone.store(true, Ordering::SeqCst);
    })
    .ok();

    let orchestrator = open_orchestrator(policy, &db_path, cancel)?;

    match cli.command {
        Command::Run(args) => {
            let result = orchestrator.run(run_options(args, RunMode::Standard, None))?;
            print!("{}", render_run_result(&result));
        }
        Command::Bootstrap { run, brief } => {
            let brief = collect_brief(brief)?;
            let result = orchestrator.run(run_options(run, RunMode::Bootstrap, Some(brief)))?;
            print!("{}", render_run_result(&result));
        }
        Command::Resume(selector) => {
            let run_id = selected(&orchestrator, &selector)?;
            let result = orchestrator.resume(&run_id)?;
            print!("{}", render_run_result(&result));
        }
        Command::Stop(selector) => {
            let run_id = selected(&orchestrator, &selector)?;
            orchestrator.stop(&run_id)?;
            println!("run {run_id} stopped");
        }
        Command::Restart { selector, dry_run } => {
            let run_id = selected(&orchestrator, &selector)?;
            let report = orchestrator.restart(&run_id, RestartOptions { dry_run })?;
            print!("{}", render_actions(&report));
        }
        Command::Cleanup {
            selector,
            keep_workspaces,
            dry_run,
        } => {
            let run_id = selected(&orchestrator, &selector)?;
            let report = orchestrator.cleanup(
                &run_id,
                CleanupOptions {
                    keep_workspaces,
                    dry_run,
                },
            )?;
            print!("{}", render_actions(&report));
        }
        Command::Close {
            selector,
            changelog_entry,
            dry_run,
        } => {
            let run_id = selected(&orchestrator, &selector)?;
            let report = orchestrator.close(
                &run_id,
                CloseOptions {
                    changelog_entry,
                    dry_run,
                },
            )?;
            print!("{}", render_actions(&report));
        }
        Command::Guide { selector, answer } => {
            let run_id = selected(&orchestrator, &selector)?;
            let request = orchestrator.guide(&run_id, &answer)?;
            println!(
                "answered guidance {} for {}@{}",
                request.id, request.agent, request.workspace
            );
        }
        Command::Status(selector) => {
            let run_id = selected(&orchestrator, &selector)?;
            print!("{}", orchestrator.status(&run_id)?.render());
        }
        Command::Runs => {
            let runs = orchestrator.list_runs()?;
            if runs.is_empty() {
                println!("no runs");
            }
            for run in runs {
                println!("{:<24} {:<18} {}", run.run_id, run.status, run.spec.mode);
            }
        }
        Command::Unlock { run_id } => {
            if orchestrator.unlock(&run_id)? {
                println!("released lock for {run_id}");
            } else {
                println!("no lock held for {run_id}");
            }
        }
        Command::PolicyInit | Command::Completions { .. } => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_brief_requires_fields() {
        let err = collect_brief(BriefArgs {
            goal: Some("ship".into()),
            no_interactive: true,
            ..BriefArgs::default()
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "missing required bootstrap intake field \"scope\"");
    }

    #[test]
    fn non_interactive_brief_records_answers() {
        let brief = collect_brief(BriefArgs {
            goal: Some("ship".into()),
            scope: Some("svc".into()),
            done_criteria: Some("tests pass".into()),
            constraints: Some("none".into()),
            merge_intent: None,
            no_interactive: true,
        })
        .unwrap();
        assert_eq!(brief.done_criteria, "tests pass");
        assert_eq!(brief.merge_intent, "");
        assert_eq!(brief.qa.len(), 4);
        assert_eq!(brief.qa[0].question, "Goal");
    }

    #[test]
    fn action_report_marks_dry_runs() {
        let text = render_actions(&ActionReport {
            run_id: "run-1".into(),
            actions: vec!["wsm merge 'ws'".into()],
            dry_run: true,
        });
        assert_eq!(text, "Actions for run-1 (dry run)\n  wsm merge 'ws'\n");
    }
}
