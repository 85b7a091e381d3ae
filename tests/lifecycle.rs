mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use common::{Harness, RUN_ID};
use metawsm::OrchestratorError;
use metawsm::config::PolicyConfig;
use metawsm::model::{AgentStatus, HealthState, RunStatus, StepKind, StepStatus, WorkspaceStrategy};
use metawsm::orchestrator::{CleanupOptions, CloseOptions, RestartOptions, RunOptions};
use metawsm::store::{LockAttempt, Store};
use metawsm::transitions::can_transition_agent;

fn options(dry_run: bool) -> RunOptions {
    RunOptions {
        run_id: Some(RUN_ID.to_string()),
        tickets: vec!["METAWSM-001".into(), "METAWSM-002".into()],
        repos: vec!["svc".into()],
        workspace_strategy: Some(WorkspaceStrategy::Create),
        dry_run,
        ..RunOptions::default()
    }
}

fn run_status(orch: &metawsm::Orchestrator) -> RunStatus {
    orch.store().get_run(RUN_ID).unwrap().unwrap().status
}

#[test]
fn dry_run_plans_six_steps_without_side_effects() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());

    let result = orch.run(options(true)).unwrap();

    assert_eq!(result.status, RunStatus::Paused);
    assert_eq!(result.steps.len(), 6);
    let names: Vec<&str> = result.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "verify-doc-ticket-METAWSM-001",
            "workspace-create-metawsm-001-1",
            "tmux-start-agent-metawsm-001-1",
            "verify-doc-ticket-METAWSM-002",
            "workspace-create-metawsm-002-1",
            "tmux-start-agent-metawsm-002-1",
        ]
    );
    assert!(matches!(result.steps[2].kind, StepKind::TmuxStart { .. }));
    assert!(h.commands.log().is_empty());
    assert!(h.sessions.0.borrow().log.is_empty());
    assert!(h.git.resets.borrow().is_empty());

    let agents = orch.store().get_agents(RUN_ID).unwrap();
    assert_eq!(agents.len(), 2);
    assert!(agents.iter().all(|a| a.status == AgentStatus::Pending));
    assert_eq!(agents[0].session_name, "agent-metawsm-001-1");
    assert_eq!(run_status(&orch), RunStatus::Paused);
}

#[test]
fn standard_run_executes_plan_and_completes() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());

    let result = orch.run(options(false)).unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Done));
    assert_eq!(
        h.commands.log()[..2],
        [
            "docmgr ticket list --ticket 'METAWSM-001'".to_string(),
            "wsm create 'metawsm-001-1' --repos 'svc' --branch 'task/metawsm-001-1'".to_string(),
        ]
    );
    assert_eq!(h.git.resets.borrow().len(), 2);
    assert!(h.git.resets.borrow()[0].ends_with("svc origin/main"));
    assert!(h.sessions.0.borrow().live.contains("agent-metawsm-002-1"));

    let agents = orch.store().get_agents(RUN_ID).unwrap();
    assert!(agents
        .iter()
        .all(|a| a.status == AgentStatus::Running && a.health == HealthState::Healthy));
}

#[test]
fn existing_run_id_is_rejected() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();
    let err = orch.run(options(true)).unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
}

#[test]
fn run_validates_tickets_and_repos() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());

    let mut no_tickets = options(true);
    no_tickets.tickets = vec![" ".into()];
    let err = orch.run(no_tickets).unwrap_err();
    assert_eq!(err.to_string(), "at least one ticket is required");

    let mut no_repos = options(true);
    no_repos.repos.clear();
    let err = orch.run(no_repos).unwrap_err();
    assert_eq!(err.to_string(), "at least one repo is required for create/fork");

    let mut reuse = options(true);
    reuse.repos.clear();
    reuse.workspace_strategy = Some(WorkspaceStrategy::Reuse);
    assert_eq!(orch.run(reuse).unwrap().steps[1].name, "workspace-reuse-metawsm-001-1");
}

#[test]
fn failed_blocking_step_fails_run_and_resume_skips_done_work() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    h.commands.fail_when("wsm create 'metawsm-002-1'", "disk full");

    let err = orch.run(options(false)).unwrap_err();

    match &err {
        OrchestratorError::ExternalTool { context, detail } => {
            assert_eq!(context, "step 5 workspace-create-metawsm-002-1 failed");
            assert!(detail.contains("disk full"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    // One attempt plus one retry.
    assert_eq!(h.commands.count("wsm create 'metawsm-002-1'"), 2);
    let run = orch.store().get_run(RUN_ID).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("disk full"));
    let steps = orch.store().get_steps(RUN_ID).unwrap();
    assert_eq!(steps[4].status, StepStatus::Failed);
    assert_eq!(steps[5].status, StepStatus::Pending);

    h.commands.0.borrow_mut().failures.clear();
    let resumed = orch.resume(RUN_ID).unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(h.commands.count("docmgr ticket list --ticket 'METAWSM-001'"), 1);
    assert_eq!(h.commands.count("wsm create 'metawsm-002-1'"), 3);
    assert!(resumed.steps.iter().all(|s| s.status == StepStatus::Done));
}

#[test]
fn non_blocking_step_is_skipped_after_retries() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();

    let mut steps = orch.store().get_steps(RUN_ID).unwrap();
    steps[3].blocking = false;
    orch.store().save_steps(RUN_ID, &steps).unwrap();
    h.commands
        .fail_when("docmgr ticket list --ticket 'METAWSM-002'", "ticket not indexed");

    let result = orch.resume(RUN_ID).unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.steps[3].status, StepStatus::Skipped);
    assert!(result.steps[3].error.as_deref().unwrap().contains("ticket not indexed"));
    assert_eq!(h.commands.count("docmgr ticket list --ticket 'METAWSM-002'"), 2);
    assert_eq!(result.steps[4].status, StepStatus::Done);
}

#[test]
fn resume_of_completed_run_replays_nothing() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();
    let before = h.commands.log().len();

    let result = orch.resume(RUN_ID).unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(h.commands.log().len(), before);
}

#[test]
fn cancel_flag_aborts_and_fails_run() {
    let h = Harness::new();
    let orch = h
        .orchestrator(PolicyConfig::default())
        .with_cancel_flag(Arc::new(AtomicBool::new(true)));

    let err = orch.run(options(false)).unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(run_status(&orch), RunStatus::Failed);
    assert!(h.commands.log().is_empty());
}

#[test]
fn held_lock_blocks_mutations_until_unlocked() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();
    assert_eq!(
        orch.store()
            .try_acquire_run_lock(RUN_ID, "other-token", "pid=1 operation=run", common::fixed_now())
            .unwrap(),
        LockAttempt::Acquired
    );

    let err = orch.stop(RUN_ID).unwrap_err();
    match err {
        OrchestratorError::MutationInProgress { holder, operation, .. } => {
            assert_eq!(operation, "stop");
            assert_eq!(holder, "pid=1 operation=run");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(run_status(&orch), RunStatus::Paused);

    assert!(orch.unlock(RUN_ID).unwrap());
    assert!(!orch.unlock(RUN_ID).unwrap());
    orch.stop(RUN_ID).unwrap();
    assert_eq!(run_status(&orch), RunStatus::Stopped);
}

#[test]
fn stop_kills_sessions_and_is_idempotent() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();

    orch.stop(RUN_ID).unwrap();
    orch.stop(RUN_ID).unwrap();

    assert_eq!(run_status(&orch), RunStatus::Stopped);
    let kills = h
        .sessions
        .0
        .borrow()
        .log
        .iter()
        .filter(|l| l.starts_with("kill "))
        .count();
    assert_eq!(kills, 2);
    let agents = orch.store().get_agents(RUN_ID).unwrap();
    assert!(agents
        .iter()
        .all(|a| a.status == AgentStatus::Stopped && a.health == HealthState::Dead));

    let err = orch.stop("run-missing").unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[test]
fn stop_rejects_completed_run() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();
    let err = orch.stop(RUN_ID).unwrap_err();
    assert!(matches!(err, OrchestratorError::IllegalTransition { entity: "run", .. }));
}

#[test]
fn restart_dry_run_lists_actions_then_restarts() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();
    let started = h.sessions.0.borrow().log.len();

    let preview = orch.restart(RUN_ID, RestartOptions { dry_run: true }).unwrap();
    assert!(preview.dry_run);
    assert_eq!(preview.actions.len(), 4);
    assert_eq!(preview.actions[0], "tmux kill-session -t 'agent-metawsm-001-1'");
    assert!(preview.actions[1].starts_with("tmux new-session -d -s 'agent-metawsm-001-1' -c '"));
    assert_eq!(h.sessions.0.borrow().log.len(), started);
    assert_eq!(run_status(&orch), RunStatus::Completed);

    let report = orch.restart(RUN_ID, RestartOptions::default()).unwrap();
    assert!(!report.dry_run);
    assert_eq!(run_status(&orch), RunStatus::Running);
    let events = orch.store().list_events(RUN_ID).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == "restart" && e.message == "restarted 2 agents"));
}

#[test]
fn restart_fails_run_when_session_dies() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();
    h.sessions
        .0
        .borrow_mut()
        .die_on_start
        .insert("agent-metawsm-001-1".to_string());

    let err = orch.restart(RUN_ID, RestartOptions::default()).unwrap_err();

    assert!(err.to_string().contains("exited immediately after start"));
    assert_eq!(run_status(&orch), RunStatus::Failed);
}

#[test]
fn cleanup_tolerates_missing_workspaces() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();
    orch.stop(RUN_ID).unwrap();
    h.commands
        .fail_when("wsm delete 'metawsm-001-1'", "Workspace metawsm-001-1 NOT FOUND");

    let preview = orch
        .cleanup(RUN_ID, CleanupOptions { keep_workspaces: false, dry_run: true })
        .unwrap();
    assert_eq!(
        preview.actions,
        [
            "tmux kill-session -t 'agent-metawsm-001-1'",
            "tmux kill-session -t 'agent-metawsm-002-1'",
            "wsm delete 'metawsm-001-1'",
            "wsm delete 'metawsm-002-1'",
        ]
    );
    assert!(h.commands.log().is_empty());

    let report = orch.cleanup(RUN_ID, CleanupOptions::default()).unwrap();
    assert_eq!(report.actions.len(), 4);
    assert_eq!(h.commands.count("wsm delete"), 2);
    assert_eq!(run_status(&orch), RunStatus::Stopped);
    let events = orch.store().list_events(RUN_ID).unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == "cleanup" && e.message == "cleanup complete; workspaces=2"));
}

#[test]
fn cleanup_keep_workspaces_and_hard_failures() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();

    let kept = orch
        .cleanup(RUN_ID, CleanupOptions { keep_workspaces: true, dry_run: false })
        .unwrap();
    assert_eq!(kept.actions.len(), 2);
    assert_eq!(h.commands.count("wsm delete"), 0);
    assert_eq!(run_status(&orch), RunStatus::Stopped);

    h.commands.fail_when("wsm delete 'metawsm-002-1'", "permission denied");
    let err = orch.cleanup(RUN_ID, CleanupOptions::default()).unwrap_err();
    assert!(matches!(err, OrchestratorError::ExternalTool { .. }));
    assert!(err.to_string().contains("permission denied"));
}

#[test]
fn close_requires_completed_and_clean_workspaces() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();
    let err = orch.close(RUN_ID, CloseOptions::default()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "run run-1 must be in completed state before close (current: paused)"
    );

    orch.resume(RUN_ID).unwrap();
    let dirty = h.workspaces.path("metawsm-002-1").join("svc");
    h.git.dirty.borrow_mut().insert(dirty);
    let err = orch.close(RUN_ID, CloseOptions::default()).unwrap_err();
    assert!(matches!(err, OrchestratorError::Precondition(_)));
    assert!(err.to_string().contains("workspace metawsm-002-1 repo"));
    assert_eq!(run_status(&orch), RunStatus::Completed);
    assert_eq!(h.commands.count("wsm merge"), 0);

    h.git.dirty.borrow_mut().clear();
    let preview = orch
        .close(RUN_ID, CloseOptions { changelog_entry: None, dry_run: true })
        .unwrap();
    assert_eq!(preview.actions.len(), 4);
    assert_eq!(run_status(&orch), RunStatus::Completed);

    let report = orch.close(RUN_ID, CloseOptions::default()).unwrap();
    assert_eq!(
        report.actions,
        [
            "wsm merge 'metawsm-001-1'",
            "wsm merge 'metawsm-002-1'",
            "docmgr ticket close --ticket 'METAWSM-001' --changelog-entry 'Closed by metawsm run run-1'",
            "docmgr ticket close --ticket 'METAWSM-002' --changelog-entry 'Closed by metawsm run run-1'",
        ]
    );
    assert_eq!(run_status(&orch), RunStatus::Closed);

    let again = orch.close(RUN_ID, CloseOptions::default()).unwrap();
    assert!(again.actions.is_empty());
    let err = orch.restart(RUN_ID, RestartOptions::default()).unwrap_err();
    assert_eq!(err.to_string(), "run run-1 is closed and cannot be restarted");
}

#[test]
fn close_failure_marks_run_failed() {
    let h = Harness::new();
    let mut policy = PolicyConfig::default();
    policy.close.require_clean_git = false;
    let orch = h.orchestrator(policy);
    orch.run(options(false)).unwrap();
    h.commands.fail_when("wsm merge 'metawsm-001-1'", "merge conflict");

    let err = orch
        .close(
            RUN_ID,
            CloseOptions {
                changelog_entry: Some("Shipped".into()),
                dry_run: false,
            },
        )
        .unwrap_err();

    assert!(err.to_string().contains("merge conflict"));
    assert_eq!(run_status(&orch), RunStatus::Failed);
    assert_eq!(h.commands.count("docmgr ticket close"), 0);
}

#[test]
fn status_reports_and_runs_are_listed() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();

    let report = orch.status(RUN_ID).unwrap();
    assert_eq!(report.run.status, RunStatus::Completed);
    assert_eq!(report.step_counts().done, 6);
    assert!(report.agents.iter().all(|a| a.health == HealthState::Healthy));
    assert!(report.render().contains("  status               completed\n"));

    h.sessions.0.borrow_mut().live.clear();
    let report = orch.status(RUN_ID).unwrap();
    assert!(report
        .agents
        .iter()
        .all(|a| a.status == AgentStatus::Dead && a.health == HealthState::Dead));

    let runs = orch.list_runs().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        orch.resolve_run_id(None, Some("METAWSM-002")).unwrap(),
        RUN_ID
    );
    assert!(matches!(
        orch.resolve_run_id(None, Some("OTHER-1")).unwrap_err(),
        OrchestratorError::NotFound(_)
    ));
}

#[test]
fn comma_separated_tickets_plan_one_workspace_each() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    let result = orch
        .run(RunOptions {
            tickets: vec!["METAWSM-001,METAWSM-002".into()],
            ..options(true)
        })
        .unwrap();

    assert_eq!(result.steps.len(), 6);
    let run = orch.store().get_run(RUN_ID).unwrap().unwrap();
    assert_eq!(run.spec.tickets, vec!["METAWSM-001", "METAWSM-002"]);
    let workspaces: Vec<_> = orch
        .store()
        .get_agents(RUN_ID)
        .unwrap()
        .into_iter()
        .map(|a| a.workspace)
        .collect();
    assert_eq!(workspaces, vec!["metawsm-001-1", "metawsm-002-1"]);
}

#[test]
fn status_leaves_never_started_agents_pending() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();
    let before = orch.store().get_agents(RUN_ID).unwrap();

    let report = orch.status(RUN_ID).unwrap();

    assert_eq!(report.run.status, RunStatus::Paused);
    assert_eq!(report.agents, before);
    assert!(report
        .agents
        .iter()
        .all(|a| a.status == AgentStatus::Pending && a.health == HealthState::Idle));
    assert!(h.sessions.0.borrow().log.is_empty());
}

#[test]
fn unreachable_tmux_keeps_stored_agent_state() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();

    h.sessions.0.borrow_mut().tmux_unreachable = true;
    let report = orch.status(RUN_ID).unwrap();
    assert!(report
        .agents
        .iter()
        .all(|a| a.status == AgentStatus::Running && a.health == HealthState::Healthy));

    h.sessions.0.borrow_mut().tmux_unreachable = false;
    h.sessions.0.borrow_mut().live.clear();
    orch.status(RUN_ID).unwrap();

    // A dead agent is not revived to idle while tmux cannot answer.
    h.sessions.0.borrow_mut().tmux_unreachable = true;
    let report = orch.status(RUN_ID).unwrap();
    assert!(report
        .agents
        .iter()
        .all(|a| a.status == AgentStatus::Dead && a.health == HealthState::Dead));
}

fn refresh_checked(orch: &metawsm::Orchestrator) {
    let before = orch.store().get_agents(RUN_ID).unwrap();
    let after = orch.status(RUN_ID).unwrap().agents;
    for (old, new) in before.iter().zip(&after) {
        assert!(
            can_transition_agent(old.status, new.status),
            "{} moved {} -> {}",
            new.workspace,
            old.status,
            new.status
        );
    }
}

fn agent_status(orch: &metawsm::Orchestrator, workspace: &str) -> AgentStatus {
    orch.store()
        .get_agents(RUN_ID)
        .unwrap()
        .into_iter()
        .find(|a| a.workspace == workspace)
        .unwrap()
        .status
}

#[test]
fn status_refresh_follows_agent_transition_table() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();
    h.sessions.0.borrow_mut().panes.insert(
        "agent-metawsm-001-1".to_string(),
        "[metawsm] agent command exited with status 2 at 2026-03-01T09:00:00+00:00\n".to_string(),
    );

    refresh_checked(&orch);
    assert_eq!(agent_status(&orch, "metawsm-001-1"), AgentStatus::Failed);
    assert_eq!(agent_status(&orch, "metawsm-002-1"), AgentStatus::Running);

    h.sessions.0.borrow_mut().tmux_unreachable = true;
    refresh_checked(&orch);
    assert_eq!(agent_status(&orch, "metawsm-001-1"), AgentStatus::Failed);

    {
        let mut state = h.sessions.0.borrow_mut();
        state.tmux_unreachable = false;
        state.live.clear();
    }
    refresh_checked(&orch);
    assert_eq!(agent_status(&orch, "metawsm-001-1"), AgentStatus::Failed);
    assert_eq!(agent_status(&orch, "metawsm-002-1"), AgentStatus::Dead);
}

#[test]
fn non_blocking_step_with_gate_error_is_skipped_without_retry() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(true)).unwrap();

    let mut steps = orch.store().get_steps(RUN_ID).unwrap();
    steps[2].blocking = false;
    orch.store().save_steps(RUN_ID, &steps).unwrap();
    let mut agent = orch
        .store()
        .get_agents(RUN_ID)
        .unwrap()
        .into_iter()
        .find(|a| a.workspace == "metawsm-001-1")
        .unwrap();
    agent.status = AgentStatus::Stopping;
    orch.store().upsert_agent(&agent).unwrap();

    let result = orch.resume(RUN_ID).unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
    assert_eq!(
        result.steps[2].error.as_deref(),
        Some("illegal agent transition stopping -> running")
    );
    let starts = h
        .sessions
        .0
        .borrow()
        .log
        .iter()
        .filter(|line| line.starts_with("start agent-metawsm-001-1 "))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(result.steps[5].status, StepStatus::Done);
}

#[test]
fn store_stamps_follow_the_engine_clock() {
    let h = Harness::new();
    let orch = h.orchestrator(PolicyConfig::default());
    orch.run(options(false)).unwrap();

    let now = common::fixed_now();
    let run = orch.store().get_run(RUN_ID).unwrap().unwrap();
    assert_eq!(run.created_at, now);
    assert_eq!(run.updated_at, now);
    let steps = orch.store().get_steps(RUN_ID).unwrap();
    assert!(steps
        .iter()
        .all(|s| s.started_at == Some(now) && s.finished_at == Some(now)));
    let events = orch.store().list_events(RUN_ID).unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.created_at == now));
}
