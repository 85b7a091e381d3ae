use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::Orchestrator;
use crate::error::Result;
use crate::health::classify;
use crate::model::{
    AgentRecord, AgentStatus, GuidanceRequest, GuidanceStatus, RunBrief, RunMode, RunRecord,
    Step, StepStatus,
};
use crate::tmux::probe_session;
use crate::transitions::can_transition_agent;

/// Point-in-time view of a run after health and signal refresh.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub run: RunRecord,
    pub steps: Vec<Step>,
    pub agents: Vec<AgentRecord>,
    pub pending_guidance: Vec<GuidanceRequest>,
    pub brief: Option<RunBrief>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub total: usize,
    pub done: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped: usize,
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "  {key:<20} {value}");
}

fn age(now: DateTime<Utc>, at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => format!("{}s", (now - at).num_seconds().max(0)),
        None => "unknown".to_string(),
    }
}

impl StatusReport {
    pub fn step_counts(&self) -> StepCounts {
        let mut counts = StepCounts {
            total: self.steps.len(),
            ..StepCounts::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Done => counts.done += 1,
                StepStatus::Running => counts.running += 1,
                StepStatus::Pending => counts.pending += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn render(&self) -> String {
        let mut output = String::new();
        let run = &self.run;
        output.push_str("Run\n");
        push_kv(&mut output, "id", &run.run_id);
        push_kv(&mut output, "status", run.status);
        push_kv(&mut output, "mode", run.spec.mode);
        push_kv(&mut output, "tickets", run.spec.tickets.join(", "));
        if let Some(error) = run.error.as_deref().filter(|e| !e.is_empty()) {
            push_kv(&mut output, "error", error);
        }

        if let Some(brief) = &self.brief {
            output.push_str("\nBrief\n");
            push_kv(&mut output, "goal", &brief.goal);
            push_kv(&mut output, "scope", &brief.scope);
            push_kv(&mut output, "done_criteria", &brief.done_criteria);
            push_kv(&mut output, "constraints", &brief.constraints);
            push_kv(&mut output, "merge_intent", &brief.merge_intent);
        }

        if !self.pending_guidance.is_empty() {
            output.push_str("\nGuidance\n");
            for request in &self.pending_guidance {
                let _ = writeln!(
                    output,
                    "  id={} {}@{} question={}",
                    request.id, request.agent, request.workspace, request.question
                );
            }
        }

        let counts = self.step_counts();
        output.push_str("\nSteps\n");
        push_kv(&mut output, "total", counts.total);
        push_kv(&mut output, "done", counts.done);
        push_kv(&mut output, "running", counts.running);
        push_kv(&mut output, "pending", counts.pending);
        push_kv(&mut output, "failed", counts.failed);
        push_kv(&mut output, "skipped", counts.skipped);

        output.push_str("\nAgents\n");
        if self.agents.is_empty() {
            output.push_str("  (none)\n");
        }
        for agent in &self.agents {
            let _ = writeln!(
                output,
                "  {}@{} session={} status={} health={} activity={} progress={}",
                agent.name,
                agent.workspace,
                agent.session_name,
                agent.status,
                agent.health,
                age(self.now, agent.last_activity_at),
                age(self.now, agent.last_progress_at),
            );
        }
        output
    }
}

impl Orchestrator {
    /// Refresh agent health (and bootstrap signals) and report the run.
    ///
    /// Takes no run lock; its writes are last-write-wins.
    pub fn status(&self, run_id: &str) -> Result<StatusReport> {
        let mut run = self.load_run(run_id)?;
        let run_id = run.run_id.clone();
        let now = self.now();

        for mut agent in self.store.get_agents(&run_id)? {
            // Pending agents never had a session; stopped ones were stopped on purpose.
            if matches!(agent.status, AgentStatus::Pending | AgentStatus::Stopped) {
                continue;
            }
            let probe = probe_session(self.sessions.as_ref(), &agent.session_name);
            let classification = classify(now, &self.policy.health, &agent, probe);
            if !can_transition_agent(agent.status, classification.status) {
                debug!(
                    run_id = %run_id,
                    agent = %agent.name,
                    workspace = %agent.workspace,
                    from = %agent.status,
                    to = %classification.status,
                    "agent classification not applied"
                );
                continue;
            }
            debug!(
                run_id = %run_id,
                agent = %agent.name,
                workspace = %agent.workspace,
                health = %classification.health,
                "agent classified"
            );
            classification.apply(&mut agent);
            self.store.upsert_agent(&agent)?;
        }

        if run.spec.mode == RunMode::Bootstrap {
            let agents = self.store.get_agents(&run_id)?;
            self.sync_bootstrap_signals(&run, &agents)?;
            run = self.load_run(&run_id)?;
        }

        Ok(StatusReport {
            steps: self.store.get_steps(&run_id)?,
            agents: self.store.get_agents(&run_id)?,
            pending_guidance: self
                .store
                .list_guidance(&run_id, Some(GuidanceStatus::Pending))?,
            brief: self.store.get_brief(&run_id)?,
            run,
            now,
        })
    }

    /// Stored runs, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.store.list_runs()?)
    }
}
