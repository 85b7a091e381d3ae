use std::collections::{BTreeSet, HashSet};
use std::thread;

use tracing::{info, warn};

use super::Orchestrator;
use crate::config::PolicyConfig;
use crate::error::{OrchestratorError, Result};
use crate::git::workspace_repo_paths;
use crate::model::{
    AgentRecord, AgentStatus, GuidanceStatus, HealthState, IntakeQa, NewEvent, RunBrief, RunMode,
    RunRecord, RunSpec, RunStatus, Step, StepKind, WorkspaceStrategy,
};
use crate::plan::{build_plan, generate_run_id, normalize_base_branch, normalize_tokens, shell_quote};
use crate::policy::{render_session_name, resolve_agents};
use crate::signals::{VALIDATION_FILE, read_validation};
use crate::tmux::{kill_command_text, start_command_text, wrap_agent_command};
use crate::transitions::can_transition_run;

const DEFAULT_MERGE_INTENT: &str = "default";

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub mode: Option<RunMode>,
    pub tickets: Vec<String>,
    pub repos: Vec<String>,
    pub workspace_strategy: Option<WorkspaceStrategy>,
    pub base_branch: Option<String>,
    /// Agent names from the policy roster; empty selects all of them.
    pub agents: Vec<String>,
    /// Required for bootstrap runs.
    pub brief: Option<BriefInput>,
    pub dry_run: bool,
}

/// Bootstrap intake answers.
#[derive(Debug, Clone, Default)]
pub struct BriefInput {
    pub goal: String,
    pub scope: String,
    pub done_criteria: String,
    pub constraints: String,
    pub merge_intent: String,
    pub qa: Vec<IntakeQa>,
}

impl BriefInput {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("goal", &self.goal),
            ("scope", &self.scope),
            ("done_criteria", &self.done_criteria),
            ("constraints", &self.constraints),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestratorError::validation(format!(
                    "missing required bootstrap intake field {field:?}"
                )));
            }
        }
        Ok(())
    }

    fn into_brief(self, run_id: &str, ticket: &str, now: chrono::DateTime<chrono::Utc>) -> RunBrief {
        let merge_intent = match self.merge_intent.trim() {
            "" => DEFAULT_MERGE_INTENT.to_string(),
            intent => intent.to_string(),
        };
        RunBrief {
            run_id: run_id.to_string(),
            ticket: ticket.to_string(),
            goal: self.goal.trim().to_string(),
            scope: self.scope.trim().to_string(),
            done_criteria: self.done_criteria.trim().to_string(),
            constraints: self.constraints.trim().to_string(),
            merge_intent,
            qa: self.qa,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub keep_workspaces: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CloseOptions {
    pub changelog_entry: Option<String>,
    pub dry_run: bool,
}

/// Shell-form actions an operation performed, or would perform on a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReport {
    pub run_id: String,
    pub actions: Vec<String>,
    pub dry_run: bool,
}

impl Orchestrator {
    pub fn run(&self, options: RunOptions) -> Result<RunResult> {
        let tickets = normalize_tokens(&options.tickets);
        if tickets.is_empty() {
            return Err(OrchestratorError::validation("at least one ticket is required"));
        }
        let strategy = options
            .workspace_strategy
            .unwrap_or(self.policy.workspace.default_strategy);
        let repos = normalize_tokens(&options.repos);
        if repos.is_empty() && strategy != WorkspaceStrategy::Reuse {
            return Err(OrchestratorError::validation(
                "at least one repo is required for create/fork",
            ));
        }
        let base_branch = normalize_base_branch(
            options
                .base_branch
                .as_deref()
                .map(str::trim)
                .filter(|branch| !branch.is_empty())
                .unwrap_or(&self.policy.workspace.base_branch),
        );
        let mode = options.mode.unwrap_or(RunMode::Standard);
        let brief = match (mode, options.brief) {
            (RunMode::Bootstrap, None) => {
                return Err(OrchestratorError::validation(
                    "bootstrap runs require an intake brief",
                ));
            }
            (_, Some(brief)) => {
                brief.validate()?;
                Some(brief)
            }
            (RunMode::Standard, None) => None,
        };
        let agents = resolve_agents(&self.policy, &options.agents)?;
        if agents.is_empty() {
            return Err(OrchestratorError::validation("no agents resolved from policy"));
        }

        let now = self.now();
        let run_id = options
            .run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| generate_run_id(now), str::to_string);
        let _lock = self.lock_run(&run_id, "run")?;
        if self.store.get_run(&run_id)?.is_some() {
            return Err(OrchestratorError::validation(format!(
                "run {run_id} already exists"
            )));
        }

        let spec = RunSpec {
            run_id: run_id.clone(),
            mode,
            tickets,
            repos,
            workspace_strategy: strategy,
            base_branch,
            agents,
            dry_run: options.dry_run,
            created_at: now,
        };
        self.store.create_run(&spec, &self.policy.snapshot()?)?;
        info!(
            run_id = %run_id,
            mode = %mode,
            tickets = spec.tickets.len(),
            agents = spec.agents.len(),
            dry_run = spec.dry_run,
            "run created"
        );
        if let Some(brief) = brief {
            self.store
                .upsert_brief(&brief.into_brief(&run_id, &spec.tickets[0], now))?;
        }

        self.transition_run(&run_id, RunStatus::Created, RunStatus::Planning, "planning run")?;
        let steps = build_plan(&spec, &self.policy);
        self.store.save_steps(&run_id, &steps)?;
        self.seed_agents(&run_id, &steps, &self.policy)?;

        if spec.dry_run {
            self.transition_run(&run_id, RunStatus::Planning, RunStatus::Paused, "dry-run complete")?;
            return Ok(RunResult {
                run_id,
                status: RunStatus::Paused,
                steps,
            });
        }

        self.transition_run(&run_id, RunStatus::Planning, RunStatus::Running, "executing plan")?;
        let status = self.drive_plan(&spec, &self.policy, &steps, "run completed", "bootstrap setup complete")?;
        Ok(RunResult {
            steps: self.store.get_steps(&run_id)?,
            run_id,
            status,
        })
    }

    /// Re-walk a persisted plan with the policy it was planned under.
    pub fn resume(&self, run_id: &str) -> Result<RunResult> {
        let run = self.load_run(run_id)?;
        let run_id = run.run_id.as_str();
        let _lock = self.lock_run(run_id, "resume")?;
        if !can_transition_run(run.status, RunStatus::Running) {
            return Err(OrchestratorError::IllegalTransition {
                entity: "run",
                from: run.status.to_string(),
                to: RunStatus::Running.to_string(),
            });
        }
        let policy = PolicyConfig::from_snapshot(&run.policy_json)?;
        let steps = self.store.get_steps(run_id)?;

        self.transition_run(run_id, run.status, RunStatus::Running, "resume requested")?;
        let status = self.drive_plan(&run.spec, &policy, &steps, "resume completed", "resume completed")?;
        Ok(RunResult {
            run_id: run_id.to_string(),
            status,
            steps: self.store.get_steps(run_id)?,
        })
    }

    /// Execute from `running` to the mode's resting status.
    fn drive_plan(
        &self,
        spec: &RunSpec,
        policy: &PolicyConfig,
        steps: &[Step],
        completed_message: &str,
        bootstrap_message: &str,
    ) -> Result<RunStatus> {
        let run_id = spec.run_id.as_str();
        if let Err(err) = self.execute_steps(spec, policy, steps) {
            self.fail_run(run_id, RunStatus::Running, &err.to_string());
            return Err(err);
        }
        match spec.mode {
            RunMode::Bootstrap => {
                self.record_event(
                    NewEvent::new(run_id, "run", run_id, "bootstrap")
                        .states(RunStatus::Running, RunStatus::Running)
                        .message(format!(
                            "{bootstrap_message}; monitoring for guidance/completion signals"
                        )),
                )?;
                info!(run_id, "bootstrap run waiting for signals");
                Ok(RunStatus::Running)
            }
            RunMode::Standard => {
                self.transition_run(run_id, RunStatus::Running, RunStatus::Completed, completed_message)?;
                Ok(RunStatus::Completed)
            }
        }
    }

    /// One pending agent record per unique (agent, workspace) session step.
    fn seed_agents(&self, run_id: &str, steps: &[Step], policy: &PolicyConfig) -> Result<()> {
        let mut seen = HashSet::new();
        let now = self.now();
        for step in steps {
            let (StepKind::TmuxStart { agent }, Some(workspace)) = (&step.kind, &step.workspace)
            else {
                continue;
            };
            if !seen.insert((agent.as_str(), workspace.as_str())) {
                continue;
            }
            self.store.upsert_agent(&AgentRecord {
                run_id: run_id.to_string(),
                name: agent.clone(),
                workspace: workspace.clone(),
                session_name: render_session_name(&policy.tmux.session_pattern, agent, workspace),
                status: AgentStatus::Pending,
                health: HealthState::Idle,
                last_activity_at: Some(now),
                last_progress_at: Some(now),
            })?;
        }
        Ok(())
    }

    pub fn stop(&self, run_id: &str) -> Result<()> {
        let run = self.load_run(run_id)?;
        let run_id = run.run_id.as_str();
        let _lock = self.lock_run(run_id, "stop")?;
        if run.status == RunStatus::Stopped {
            info!(run_id, "run already stopped");
            return Ok(());
        }
        if !can_transition_run(run.status, RunStatus::Stopping) {
            return Err(OrchestratorError::IllegalTransition {
                entity: "run",
                from: run.status.to_string(),
                to: RunStatus::Stopping.to_string(),
            });
        }
        self.transition_run(run_id, run.status, RunStatus::Stopping, "stop requested")?;

        let now = self.now();
        for mut agent in self.store.get_agents(run_id)? {
            let session = self.session_for(&agent);
            if let Err(err) = self.sessions.kill(&session) {
                warn!(run_id, session = %session, error = %format!("{err:#}"), "failed to kill session");
            }
            agent.session_name = session;
            agent.last_activity_at = Some(now);
            self.set_agent_state(&mut agent, AgentStatus::Stopped, HealthState::Dead)?;
        }
        self.transition_run(run_id, RunStatus::Stopping, RunStatus::Stopped, "run stopped")
    }

    pub fn restart(&self, run_id: &str, options: RestartOptions) -> Result<ActionReport> {
        let run = self.load_run(run_id)?;
        let run_id = run.run_id.as_str();
        let _lock = self.lock_run(run_id, "restart")?;
        if run.status == RunStatus::Closed {
            return Err(OrchestratorError::precondition(format!(
                "run {run_id} is closed and cannot be restarted"
            )));
        }
        let agents = self.store.get_agents(run_id)?;
        if agents.is_empty() {
            return Err(OrchestratorError::precondition(format!(
                "run {run_id} has no agents to restart"
            )));
        }

        let mut planned = Vec::with_capacity(agents.len());
        for agent in agents {
            let path = self.resolve_workspace(&agent.workspace)?;
            let command = wrap_agent_command(run.spec.agent_command(&agent.name).unwrap_or(""));
            let session = self.session_for(&agent);
            planned.push((agent, path, session, command));
        }
        let actions: Vec<String> = planned
            .iter()
            .flat_map(|(_, path, session, command)| {
                [
                    kill_command_text(session),
                    start_command_text(session, path, command),
                ]
            })
            .collect();
        if options.dry_run {
            return Ok(ActionReport {
                run_id: run_id.to_string(),
                actions,
                dry_run: true,
            });
        }

        let mut status = run.status;
        if status != RunStatus::Running && can_transition_run(status, RunStatus::Running) {
            self.transition_run(run_id, status, RunStatus::Running, "restart requested")?;
            status = RunStatus::Running;
        }

        let count = planned.len();
        for (mut agent, path, session, command) in planned {
            if let Err(err) = self.relaunch(&mut agent, &path, &session, &command) {
                self.fail_run(run_id, status, &err.to_string());
                return Err(err);
            }
        }
        self.record_event(
            NewEvent::new(run_id, "run", run_id, "restart")
                .message(format!("restarted {count} agents")),
        )?;
        info!(run_id, agents = count, "agents restarted");
        Ok(ActionReport {
            run_id: run_id.to_string(),
            actions,
            dry_run: false,
        })
    }

    fn relaunch(
        &self,
        agent: &mut AgentRecord,
        path: &std::path::Path,
        session: &str,
        command: &str,
    ) -> Result<()> {
        self.check_cancelled()?;
        if let Err(err) = self.sessions.kill(session) {
            warn!(session, error = %format!("{err:#}"), "kill before restart failed");
        }
        self.sessions
            .start(session, path, command)
            .map_err(|err| OrchestratorError::external(format!("restart session {session}"), err))?;
        if !self.timing.start_grace.is_zero() {
            thread::sleep(self.timing.start_grace);
        }
        self.verify_session_started(session)?;
        let now = self.now();
        agent.session_name = session.to_string();
        agent.last_activity_at = Some(now);
        agent.last_progress_at = Some(now);
        self.set_agent_state(agent, AgentStatus::Running, HealthState::Healthy)
    }

    pub fn cleanup(&self, run_id: &str, options: CleanupOptions) -> Result<ActionReport> {
        let run = self.load_run(run_id)?;
        let run_id = run.run_id.as_str();
        let _lock = self.lock_run(run_id, "cleanup")?;
        let agents = self.store.get_agents(run_id)?;
        let workspaces = workspace_names(&agents);

        let mut actions: Vec<String> = agents
            .iter()
            .map(|agent| kill_command_text(&self.session_for(agent)))
            .collect();
        if !options.keep_workspaces {
            actions.extend(
                workspaces
                    .iter()
                    .map(|ws| format!("wsm delete {}", shell_quote(ws))),
            );
        }
        if options.dry_run {
            return Ok(ActionReport {
                run_id: run_id.to_string(),
                actions,
                dry_run: true,
            });
        }

        let now = self.now();
        for mut agent in agents {
            let session = self.session_for(&agent);
            if let Err(err) = self.sessions.kill(&session) {
                warn!(run_id, session = %session, error = %format!("{err:#}"), "failed to kill session");
            }
            agent.session_name = session;
            agent.last_activity_at = Some(now);
            self.set_agent_state(&mut agent, AgentStatus::Stopped, HealthState::Dead)?;
        }

        if !options.keep_workspaces {
            for workspace in &workspaces {
                let command = format!("wsm delete {}", shell_quote(workspace));
                if let Err(err) = self.commands.run(&command, None) {
                    let text = format!("{err:#}").to_lowercase();
                    if text.contains("workspace") && text.contains("not found") {
                        info!(run_id, workspace = %workspace, "workspace already deleted");
                        continue;
                    }
                    let err = OrchestratorError::external(format!("delete workspace {workspace}"), err);
                    self.fail_run(run_id, run.status, &err.to_string());
                    return Err(err);
                }
            }
        }

        if run.status != RunStatus::Stopped && can_transition_run(run.status, RunStatus::Stopping) {
            self.transition_run(run_id, run.status, RunStatus::Stopping, "cleanup requested")?;
            self.transition_run(run_id, RunStatus::Stopping, RunStatus::Stopped, "cleanup completed")?;
        }
        self.record_event(
            NewEvent::new(run_id, "run", run_id, "cleanup").message(format!(
                "cleanup complete; workspaces={}",
                workspaces.len()
            )),
        )?;
        Ok(ActionReport {
            run_id: run_id.to_string(),
            actions,
            dry_run: false,
        })
    }

    /// Merge workspaces and close tickets once a run has completed.
    ///
    /// Every gate runs before the first mutation; a failed merge or ticket
    /// close leaves the run `failed`.
    pub fn close(&self, run_id: &str, options: CloseOptions) -> Result<ActionReport> {
        let run = self.load_run(run_id)?;
        let run_id = run.run_id.as_str();
        let _lock = self.lock_run(run_id, "close")?;
        match run.status {
            RunStatus::Closed => {
                info!(run_id, "run already closed");
                return Ok(ActionReport {
                    run_id: run_id.to_string(),
                    actions: Vec::new(),
                    dry_run: options.dry_run,
                });
            }
            RunStatus::Completed => {}
            other => {
                return Err(OrchestratorError::precondition(format!(
                    "run {run_id} must be in completed state before close (current: {other})"
                )));
            }
        }

        let workspaces = workspace_names(&self.store.get_agents(run_id)?);
        if self.policy.close.require_clean_git {
            self.ensure_workspaces_clean(&run, &workspaces)?;
        }
        if run.spec.mode == RunMode::Bootstrap {
            self.ensure_bootstrap_close_checks(run_id, &workspaces)?;
        }

        let entry = options
            .changelog_entry
            .as_deref()
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map_or_else(|| format!("Closed by metawsm run {run_id}"), str::to_string);
        let mut actions: Vec<String> = workspaces
            .iter()
            .map(|ws| format!("wsm merge {}", shell_quote(ws)))
            .collect();
        actions.extend(run.spec.tickets.iter().map(|ticket| {
            format!(
                "docmgr ticket close --ticket {} --changelog-entry {}",
                shell_quote(ticket),
                shell_quote(&entry)
            )
        }));
        if options.dry_run {
            return Ok(ActionReport {
                run_id: run_id.to_string(),
                actions,
                dry_run: true,
            });
        }

        self.transition_run(run_id, RunStatus::Completed, RunStatus::Closing, "close started")?;
        for command in &actions {
            let outcome = self
                .check_cancelled()
                .and_then(|()| {
                    self.commands
                        .run(command, None)
                        .map_err(|err| OrchestratorError::external("close command", err))
                });
            if let Err(err) = outcome {
                self.fail_run(run_id, RunStatus::Closing, &err.to_string());
                return Err(err);
            }
        }
        self.transition_run(run_id, RunStatus::Closing, RunStatus::Closed, "close completed")?;
        Ok(ActionReport {
            run_id: run_id.to_string(),
            actions,
            dry_run: false,
        })
    }

    fn ensure_workspaces_clean(&self, run: &RunRecord, workspaces: &[String]) -> Result<()> {
        for workspace in workspaces {
            let path = self.resolve_workspace(workspace)?;
            for repo in workspace_repo_paths(self.git.as_ref(), &path, &run.spec.repos) {
                let dirty = self.git.is_dirty(&repo).map_err(|err| {
                    OrchestratorError::external(format!("inspect repo {}", repo.display()), err)
                })?;
                if dirty {
                    return Err(OrchestratorError::precondition(format!(
                        "workspace {workspace} repo {} has uncommitted changes; close blocked",
                        repo.display()
                    )));
                }
            }
        }
        Ok(())
    }

    fn ensure_bootstrap_close_checks(&self, run_id: &str, workspaces: &[String]) -> Result<()> {
        let brief = self.store.get_brief(run_id)?.ok_or_else(|| {
            OrchestratorError::precondition(format!(
                "bootstrap run {run_id} is missing run brief; close blocked"
            ))
        })?;
        let done_criteria = brief.done_criteria.trim();
        if done_criteria.is_empty() {
            return Err(OrchestratorError::precondition(format!(
                "bootstrap run {run_id} has empty done criteria; close blocked"
            )));
        }
        let pending = self
            .store
            .list_guidance(run_id, Some(GuidanceStatus::Pending))?;
        if !pending.is_empty() {
            return Err(OrchestratorError::precondition(format!(
                "bootstrap run {run_id} has {} pending guidance request(s); close blocked",
                pending.len()
            )));
        }

        for workspace in workspaces {
            let path = self.resolve_workspace(workspace)?;
            let validation = read_validation(&path)
                .map_err(|err| {
                    OrchestratorError::precondition(format!(
                        "workspace {workspace} has an unreadable {VALIDATION_FILE}: {err:#}; close blocked"
                    ))
                })?
                .ok_or_else(|| {
                    OrchestratorError::precondition(format!(
                        "workspace {workspace} is missing .metawsm/{VALIDATION_FILE}; close blocked"
                    ))
                })?;
            if !validation.matches_run(run_id) {
                return Err(OrchestratorError::precondition(format!(
                    "workspace {workspace} validation result run_id mismatch ({})",
                    validation.run_id.trim()
                )));
            }
            if !validation.passed() {
                return Err(OrchestratorError::precondition(format!(
                    "workspace {workspace} validation status={:?}; close blocked",
                    validation.status
                )));
            }
            if validation.done_criteria.trim() != done_criteria {
                return Err(OrchestratorError::precondition(format!(
                    "workspace {workspace} validation done_criteria mismatch; close blocked"
                )));
            }
        }
        Ok(())
    }

    /// Stored session name, or the policy rendering when absent.
    fn session_for(&self, agent: &AgentRecord) -> String {
        let stored = agent.session_name.trim();
        if stored.is_empty() {
            render_session_name(&self.policy.tmux.session_pattern, &agent.name, &agent.workspace)
        } else {
            stored.to_string()
        }
    }
}

/// Sorted, de-duplicated non-empty workspace names.
fn workspace_names(agents: &[AgentRecord]) -> Vec<String> {
    agents
        .iter()
        .map(|agent| agent.workspace.trim())
        .filter(|ws| !ws.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
