//! Run orchestration engine.
//!
//! [`Orchestrator`] owns the injected policy and the collaborator ports and
//! exposes the lifecycle operations. Every operation runs to completion on the
//! caller's thread; health and guidance refresh happen only when `status` is
//! polled.

mod executor;
mod lifecycle;
mod reconcile;
mod status;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use crate::config::PolicyConfig;
use crate::error::{OrchestratorError, Result};
use crate::git::GitInspector;
use crate::model::{AgentRecord, AgentStatus, HealthState, NewEvent, RunRecord, RunStatus};
use crate::shell::CommandRunner;
use crate::store::{LockAttempt, Store};
use crate::tmux::SessionRunner;
use crate::transitions::{can_transition_agent, can_transition_run};
use crate::workspace::WorkspaceResolver;

pub use lifecycle::{
    ActionReport, BriefInput, CleanupOptions, CloseOptions, RestartOptions, RunOptions, RunResult,
};
pub use status::{StatusReport, StepCounts};

/// Delays the executor waits on; tests run with [`ExecutorTiming::immediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorTiming {
    /// Pause between failed attempts of one step.
    pub retry_backoff: Duration,
    /// Pause between starting a session and checking it is still alive.
    pub start_grace: Duration,
}

impl Default for ExecutorTiming {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_millis(300),
            start_grace: Duration::from_millis(200),
        }
    }
}

impl ExecutorTiming {
    pub fn immediate() -> Self {
        Self {
            retry_backoff: Duration::ZERO,
            start_grace: Duration::ZERO,
        }
    }
}

/// Collaborators the engine drives.
pub struct Ports {
    pub store: Box<dyn Store>,
    pub sessions: Box<dyn SessionRunner>,
    pub commands: Box<dyn CommandRunner>,
    pub workspaces: Box<dyn WorkspaceResolver>,
    pub git: Box<dyn GitInspector>,
}

pub struct Orchestrator {
    policy: PolicyConfig,
    store: Box<dyn Store>,
    sessions: Box<dyn SessionRunner>,
    commands: Box<dyn CommandRunner>,
    workspaces: Box<dyn WorkspaceResolver>,
    git: Box<dyn GitInspector>,
    timing: ExecutorTiming,
    cancel: Arc<AtomicBool>,
    clock: fn() -> DateTime<Utc>,
}

/// Per-run mutation lock; released on drop.
pub(crate) struct RunLock<'a> {
    store: &'a dyn Store,
    run_id: String,
    token: String,
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.release_run_lock(&self.run_id, &self.token) {
            warn!(run_id = %self.run_id, error = %format!("{err:#}"), "failed to release run lock");
        }
    }
}

impl Orchestrator {
    pub fn new(policy: PolicyConfig, ports: Ports) -> Self {
        Self {
            policy,
            store: ports.store,
            sessions: ports.sessions,
            commands: ports.commands,
            workspaces: ports.workspaces,
            git: ports.git,
            timing: ExecutorTiming::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            clock: Utc::now,
        }
    }

    pub fn with_timing(mut self, timing: ExecutorTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Share a flag that aborts the current operation at the next step boundary.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Cancelled);
        }
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        let run_id = run_id.trim();
        if run_id.is_empty() {
            return Err(OrchestratorError::validation("run id is required"));
        }
        self.store
            .get_run(run_id)?
            .ok_or_else(|| OrchestratorError::not_found(format!("run {run_id} not found")))
    }

    /// Pick a run by id, or the newest run that includes `ticket`.
    pub fn resolve_run_id(&self, run_id: Option<&str>, ticket: Option<&str>) -> Result<String> {
        if let Some(run_id) = run_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Ok(run_id.to_string());
        }
        let Some(ticket) = ticket.map(str::trim).filter(|t| !t.is_empty()) else {
            return Err(OrchestratorError::validation("either a run id or a ticket is required"));
        };
        self.store
            .list_runs()?
            .into_iter()
            .find(|run| run.spec.tickets.iter().any(|t| t == ticket))
            .map(|run| run.run_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("no run found for ticket {ticket}")))
    }

    fn lock_run(&self, run_id: &str, operation: &str) -> Result<RunLock<'_>> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = self.now();
        let holder = format!(
            "pid={} operation={operation} at={}",
            std::process::id(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        match self.store.try_acquire_run_lock(run_id, &token, &holder, now)? {
            LockAttempt::Acquired => {
                debug!(run_id, operation, "run lock acquired");
                Ok(RunLock {
                    store: self.store.as_ref(),
                    run_id: run_id.to_string(),
                    token,
                })
            }
            LockAttempt::Held { holder } => Err(OrchestratorError::MutationInProgress {
                run_id: run_id.to_string(),
                operation: operation.to_string(),
                holder,
            }),
        }
    }

    /// Force-release a stale lock. Returns whether one was held.
    pub fn unlock(&self, run_id: &str) -> Result<bool> {
        let released = self.store.force_release_run_lock(run_id.trim())?;
        if released {
            info!(run_id, "run lock force-released");
        }
        Ok(released)
    }

    fn transition_run(&self, run_id: &str, from: RunStatus, to: RunStatus, message: &str) -> Result<()> {
        if !can_transition_run(from, to) {
            return Err(OrchestratorError::IllegalTransition {
                entity: "run",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let error = (to == RunStatus::Failed).then_some(message);
        self.store.update_run_status(run_id, to, error, self.now())?;
        self.record_event(
            NewEvent::new(run_id, "run", run_id, "transition")
                .states(from, to)
                .message(message),
        )?;
        info!(run_id, from = %from, to = %to, message, "run transition");
        Ok(())
    }

    /// Best-effort move to `failed` after an aborted operation.
    fn fail_run(&self, run_id: &str, from: RunStatus, message: &str) {
        if !can_transition_run(from, RunStatus::Failed) {
            warn!(run_id, from = %from, "run cannot be marked failed");
            return;
        }
        if let Err(err) = self.transition_run(run_id, from, RunStatus::Failed, message) {
            warn!(run_id, error = %err, "failed to mark run failed");
        }
    }

    /// Append a lifecycle event stamped with the engine clock.
    fn record_event(&self, event: NewEvent) -> Result<()> {
        self.store.add_event(&event, self.now())?;
        Ok(())
    }

    /// Gated agent status write for lifecycle operations.
    fn set_agent_state(
        &self,
        agent: &mut AgentRecord,
        status: AgentStatus,
        health: HealthState,
    ) -> Result<()> {
        if !can_transition_agent(agent.status, status) {
            return Err(OrchestratorError::IllegalTransition {
                entity: "agent",
                from: agent.status.to_string(),
                to: status.to_string(),
            });
        }
        agent.status = status;
        agent.health = health;
        self.store.upsert_agent(agent)?;
        Ok(())
    }
}
