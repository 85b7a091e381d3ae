use std::path::PathBuf;
use std::thread;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use super::Orchestrator;
use crate::config::PolicyConfig;
use crate::error::{OrchestratorError, Result};
use crate::git::align_to_base;
use crate::health::SessionProbe;
use crate::model::{
    AgentRecord, AgentStatus, HealthState, NewEvent, RunSpec, ShellAction, Step, StepKind,
    StepStatus, WorkspaceStrategy,
};
use crate::policy::render_session_name;
use crate::tmux::{probe_session, wrap_agent_command};
use crate::transitions::can_transition_step;

impl Orchestrator {
    /// Walk the plan in index order, skipping settled steps.
    ///
    /// Statuses are re-read from the store before each step so a resumed run
    /// never repeats finished work.
    pub(super) fn execute_steps(
        &self,
        spec: &RunSpec,
        policy: &PolicyConfig,
        steps: &[Step],
    ) -> Result<()> {
        let attempts = policy.execution.step_retries.saturating_add(1);
        let run_id = spec.run_id.as_str();

        for step in steps {
            self.check_cancelled()?;
            let mut status = self
                .store
                .get_steps(run_id)?
                .iter()
                .find(|stored| stored.index == step.index)
                .map_or(step.status, |stored| stored.status);
            if status.is_settled() {
                debug!(run_id, step = step.index, status = %status, "step already settled");
                continue;
            }

            let mut last_error = None;
            for attempt in 1..=attempts {
                self.check_cancelled()?;
                self.set_step_status(run_id, step, &mut status, StepStatus::Running, None)?;
                self.record_event(
                    NewEvent::new(run_id, "step", &step.index.to_string(), "attempt")
                        .states("", StepStatus::Running)
                        .message(format!("attempt {attempt}")),
                )?;

                match self.execute_step(spec, policy, step) {
                    Ok(()) => {
                        self.set_step_status(run_id, step, &mut status, StepStatus::Done, None)?;
                        self.record_event(
                            NewEvent::new(run_id, "step", &step.index.to_string(), "done")
                                .states(StepStatus::Running, StepStatus::Done)
                                .message(step.name.as_str()),
                        )?;
                        info!(run_id, step = step.index, name = %step.name, attempt, "step done");
                        last_error = None;
                        break;
                    }
                    Err(err) => {
                        let text = err.to_string();
                        self.set_step_status(
                            run_id,
                            step,
                            &mut status,
                            StepStatus::Failed,
                            Some(&text),
                        )?;
                        self.record_event(
                            NewEvent::new(run_id, "step", &step.index.to_string(), "failed")
                                .states(StepStatus::Running, StepStatus::Failed)
                                .message(text.as_str()),
                        )?;
                        let retryable = err.is_retryable();
                        if !retryable
                            && (step.blocking || matches!(err, OrchestratorError::Cancelled))
                        {
                            return Err(err);
                        }
                        warn!(
                            run_id,
                            step = step.index,
                            name = %step.name,
                            attempt,
                            attempts,
                            error = %text,
                            "step attempt failed"
                        );
                        last_error = Some(err);
                        if !retryable {
                            break;
                        }
                        if attempt < attempts && !self.timing.retry_backoff.is_zero() {
                            thread::sleep(self.timing.retry_backoff);
                        }
                    }
                }
            }

            if let Some(err) = last_error {
                if step.blocking {
                    return Err(OrchestratorError::ExternalTool {
                        context: format!("step {} {} failed", step.index, step.name),
                        detail: err.to_string(),
                    });
                }
                let text = err.to_string();
                self.set_step_status(run_id, step, &mut status, StepStatus::Skipped, Some(&text))?;
                warn!(run_id, step = step.index, name = %step.name, "non-blocking step skipped");
            }
        }
        Ok(())
    }

    fn set_step_status(
        &self,
        run_id: &str,
        step: &Step,
        current: &mut StepStatus,
        to: StepStatus,
        error: Option<&str>,
    ) -> Result<()> {
        if !can_transition_step(*current, to) {
            return Err(OrchestratorError::IllegalTransition {
                entity: "step",
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        self.store.update_step_status(run_id, step.index, to, error, self.now())?;
        *current = to;
        Ok(())
    }

    fn execute_step(&self, spec: &RunSpec, policy: &PolicyConfig, step: &Step) -> Result<()> {
        match &step.kind {
            StepKind::Shell { command, action } => {
                if command.trim().is_empty() {
                    return Err(OrchestratorError::external(
                        "shell step",
                        anyhow!("empty shell command"),
                    ));
                }
                self.commands
                    .run(command, None)
                    .map_err(|err| OrchestratorError::external("shell command", err))?;
                if *action == ShellAction::ProvisionWorkspace(WorkspaceStrategy::Create) {
                    let workspace = step_workspace(step)?;
                    let path = self.resolve_workspace(workspace)?;
                    align_to_base(self.git.as_ref(), &path, &spec.repos, &spec.base_branch)
                        .map_err(|err| {
                            OrchestratorError::external(format!("align workspace {workspace}"), err)
                        })?;
                }
                Ok(())
            }
            StepKind::TmuxStart { agent } => self.start_agent_session(spec, policy, step, agent),
        }
    }

    fn start_agent_session(
        &self,
        spec: &RunSpec,
        policy: &PolicyConfig,
        step: &Step,
        agent: &str,
    ) -> Result<()> {
        let workspace = step_workspace(step)?;
        let path = self.resolve_workspace(workspace)?;
        let session = render_session_name(&policy.tmux.session_pattern, agent, workspace);

        let exists = self
            .sessions
            .has_session(&session)
            .map_err(|err| OrchestratorError::external(format!("probe session {session}"), err))?;
        if exists {
            debug!(run_id = %spec.run_id, session = %session, "session already running");
        } else {
            let command = wrap_agent_command(spec.agent_command(agent).unwrap_or(""));
            self.sessions
                .start(&session, &path, &command)
                .map_err(|err| OrchestratorError::external(format!("start session {session}"), err))?;
            if !self.timing.start_grace.is_zero() {
                thread::sleep(self.timing.start_grace);
            }
            self.verify_session_started(&session)?;
        }

        let mut record = self
            .store
            .get_agents(&spec.run_id)?
            .into_iter()
            .find(|a| a.name == agent && a.workspace == workspace)
            .unwrap_or_else(|| AgentRecord {
                run_id: spec.run_id.clone(),
                name: agent.to_string(),
                workspace: workspace.to_string(),
                session_name: session.clone(),
                status: AgentStatus::Pending,
                health: HealthState::Idle,
                last_activity_at: None,
                last_progress_at: None,
            });
        let now = self.now();
        record.session_name = session;
        record.last_activity_at = Some(now);
        record.last_progress_at = Some(now);
        self.set_agent_state(&mut record, AgentStatus::Running, HealthState::Healthy)
    }

    /// A started session must still exist and must not already show a failed exit.
    pub(super) fn verify_session_started(&self, session: &str) -> Result<()> {
        match probe_session(self.sessions.as_ref(), session) {
            SessionProbe::Missing => Err(OrchestratorError::external(
                format!("start session {session}"),
                anyhow!("tmux session {session} exited immediately after start"),
            )),
            SessionProbe::Alive {
                exit_code: Some(code),
                ..
            } if code != 0 => Err(OrchestratorError::external(
                format!("start session {session}"),
                anyhow!("agent command exited with status {code}"),
            )),
            _ => Ok(()),
        }
    }

    pub(super) fn resolve_workspace(&self, workspace: &str) -> Result<PathBuf> {
        self.workspaces
            .resolve(workspace)
            .map_err(|err| OrchestratorError::external(format!("resolve workspace {workspace}"), err))
    }
}

fn step_workspace(step: &Step) -> Result<&str> {
    step.workspace.as_deref().ok_or_else(|| {
        OrchestratorError::Internal(anyhow!(
            "step {} {} has no workspace",
            step.index,
            step.name
        ))
    })
}
