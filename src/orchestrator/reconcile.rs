use std::collections::HashSet;

use tracing::{info, warn};

use super::Orchestrator;
use crate::error::{OrchestratorError, Result};
use crate::model::{
    AgentRecord, AgentStatus, GuidanceRequest, GuidanceStatus, NewEvent, NewGuidanceRequest,
    RunRecord, RunStatus, guidance_key,
};
use crate::signals::{
    GuidanceResponseSignal, clear_guidance_request, read_completion, read_guidance_request,
    write_guidance_response,
};

impl Orchestrator {
    /// Fold workspace signal files into run state for a bootstrap run.
    ///
    /// Returns the run status after reconciliation.
    pub(super) fn sync_bootstrap_signals(
        &self,
        run: &RunRecord,
        agents: &[AgentRecord],
    ) -> Result<RunStatus> {
        let run_id = run.run_id.as_str();
        let status = run.status;
        if !matches!(status, RunStatus::Running | RunStatus::AwaitingGuidance) {
            return Ok(status);
        }

        if let Some(failed) = agents.iter().find(|a| a.status == AgentStatus::Failed) {
            let message = format!("agent {}@{} failed", failed.name, failed.workspace);
            self.transition_run(run_id, status, RunStatus::Failed, &message)?;
            return Ok(RunStatus::Failed);
        }

        let mut pending: HashSet<String> = self
            .store
            .list_guidance(run_id, Some(GuidanceStatus::Pending))?
            .iter()
            .map(GuidanceRequest::key)
            .collect();
        let mut all_complete = !agents.is_empty();

        for agent in agents {
            let path = match self.workspaces.resolve(&agent.workspace) {
                Ok(path) => path,
                Err(err) => {
                    warn!(run_id, workspace = %agent.workspace, error = %format!("{err:#}"), "cannot resolve workspace");
                    all_complete = false;
                    continue;
                }
            };

            match read_guidance_request(&path) {
                Ok(Some(signal)) if signal.matches_run(run_id) => {
                    let agent_name = if signal.agent.is_empty() {
                        agent.name.clone()
                    } else {
                        signal.agent.clone()
                    };
                    let key = guidance_key(&agent.workspace, &agent_name, &signal.question);
                    if pending.insert(key) {
                        let id = self.store.add_guidance_request(&NewGuidanceRequest {
                            run_id: run_id.to_string(),
                            workspace: agent.workspace.clone(),
                            agent: agent_name.clone(),
                            question: signal.question.clone(),
                            context: signal.context.clone(),
                            created_at: self.now(),
                        })?;
                        self.record_event(
                            NewEvent::new(run_id, "guidance", &id.to_string(), "requested")
                                .states("", GuidanceStatus::Pending)
                                .message(format!("{agent_name}@{}", agent.workspace)),
                        )?;
                        info!(run_id, guidance_id = id, agent = %agent_name, workspace = %agent.workspace, "guidance requested");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(run_id, workspace = %agent.workspace, error = %format!("{err:#}"), "unreadable guidance request");
                }
            }

            match read_completion(&path) {
                Ok(Some(signal)) if signal.matches(run_id, &agent.name) => {
                    let mut record = agent.clone();
                    record.last_progress_at = Some(self.now());
                    self.store.upsert_agent(&record)?;
                }
                Ok(_) => all_complete = false,
                Err(err) => {
                    warn!(run_id, workspace = %agent.workspace, error = %format!("{err:#}"), "unreadable completion signal");
                    all_complete = false;
                }
            }
        }

        if status == RunStatus::Running && !pending.is_empty() {
            self.transition_run(
                run_id,
                status,
                RunStatus::AwaitingGuidance,
                "awaiting operator guidance",
            )?;
            return Ok(RunStatus::AwaitingGuidance);
        }
        if status == RunStatus::Running && all_complete {
            self.transition_run(run_id, status, RunStatus::Completed, "completion signal detected")?;
            return Ok(RunStatus::Completed);
        }
        Ok(status)
    }

    /// Answer the oldest pending guidance request and resume the run.
    pub fn guide(&self, run_id: &str, answer: &str) -> Result<GuidanceRequest> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(OrchestratorError::validation("guidance answer is required"));
        }
        let run = self.load_run(run_id)?;
        let run_id = run.run_id.as_str();
        let _lock = self.lock_run(run_id, "guide")?;
        if run.status != RunStatus::AwaitingGuidance {
            return Err(OrchestratorError::precondition(format!(
                "run {run_id} is not awaiting guidance (current: {})",
                run.status
            )));
        }
        let mut request = self
            .store
            .list_guidance(run_id, Some(GuidanceStatus::Pending))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                OrchestratorError::precondition(format!(
                    "run {run_id} has no pending guidance requests"
                ))
            })?;

        let path = self.resolve_workspace(&request.workspace)?;
        let now = self.now();
        let response = GuidanceResponseSignal::new(
            request.id,
            run_id,
            &request.agent,
            &request.question,
            answer,
            now,
        );
        write_guidance_response(&path, &response).map_err(|err| {
            OrchestratorError::external(format!("write guidance response for {}", request.workspace), err)
        })?;
        clear_guidance_request(&path).map_err(|err| {
            OrchestratorError::external(format!("clear guidance request for {}", request.workspace), err)
        })?;
        self.store.mark_guidance_answered(request.id, answer, self.now())?;
        self.record_event(
            NewEvent::new(run_id, "guidance", &request.id.to_string(), "answered")
                .states(GuidanceStatus::Pending, GuidanceStatus::Answered)
                .message(format!("{}@{}", request.agent, request.workspace)),
        )?;

        if let Some(mut agent) = self
            .store
            .get_agents(run_id)?
            .into_iter()
            .find(|a| a.name == request.agent && a.workspace == request.workspace)
        {
            agent.last_progress_at = Some(now);
            self.store.upsert_agent(&agent)?;
        }

        self.transition_run(
            run_id,
            RunStatus::AwaitingGuidance,
            RunStatus::Running,
            "guidance answered",
        )?;

        request.status = GuidanceStatus::Answered;
        request.answer = Some(answer.to_string());
        request.answered_at = Some(now);
        Ok(request)
    }
}
