//! Persistence port and its SQLite implementation.
//!
//! The store is the authoritative record of every run: the spec and policy
//! snapshot used for plan replay, step progress, agent sessions, guidance
//! requests, the bootstrap brief, and an append-only lifecycle event log.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::model::{
    AgentRecord, AgentStatus, GuidanceRequest, GuidanceStatus, HealthState, IntakeQa,
    LifecycleEvent, NewEvent, NewGuidanceRequest, RunBrief, RunRecord, RunSpec, RunStatus,
    ShellAction, Step, StepKind, StepStatus,
};

/// Result of trying to take a run's mutation lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Held { holder: String },
}

pub trait Store {
    fn create_run(&self, spec: &RunSpec, policy_json: &str) -> Result<()>;
    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;
    fn list_runs(&self) -> Result<Vec<RunRecord>>;
    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Replace the run's plan.
    fn save_steps(&self, run_id: &str, steps: &[Step]) -> Result<()>;
    fn get_steps(&self, run_id: &str) -> Result<Vec<Step>>;
    /// Stamps `started_at` on `running` and `finished_at` on settled or failed.
    fn update_step_status(
        &self,
        run_id: &str,
        index: u32,
        status: StepStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    fn upsert_agent(&self, agent: &AgentRecord) -> Result<()>;
    fn get_agents(&self, run_id: &str) -> Result<Vec<AgentRecord>>;

    fn add_event(&self, event: &NewEvent, at: DateTime<Utc>) -> Result<()>;
    fn list_events(&self, run_id: &str) -> Result<Vec<LifecycleEvent>>;

    fn upsert_brief(&self, brief: &RunBrief) -> Result<()>;
    fn get_brief(&self, run_id: &str) -> Result<Option<RunBrief>>;

    fn add_guidance_request(&self, request: &NewGuidanceRequest) -> Result<i64>;
    /// Oldest first.
    fn list_guidance(&self, run_id: &str, status: Option<GuidanceStatus>)
    -> Result<Vec<GuidanceRequest>>;
    fn mark_guidance_answered(&self, id: i64, answer: &str, at: DateTime<Utc>) -> Result<()>;

    fn try_acquire_run_lock(
        &self,
        run_id: &str,
        token: &str,
        holder: &str,
        at: DateTime<Utc>,
    ) -> Result<LockAttempt>;
    fn release_run_lock(&self, run_id: &str, token: &str) -> Result<()>;
    /// Drop a lock regardless of owner. Returns whether one existed.
    fn force_release_run_lock(&self, run_id: &str) -> Result<bool>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_opt(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {raw:?}"))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_ts(raw).map(Some),
    }
}

fn parse_status<T>(raw: &str, parse: fn(&str) -> Option<T>, what: &str) -> Result<T> {
    parse(raw).ok_or_else(|| anyhow!("unknown {what} {raw:?}"))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

struct RunRow {
    run_id: String,
    status: String,
    spec_json: String,
    policy_json: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        let spec: RunSpec = serde_json::from_str(&self.spec_json)
            .with_context(|| format!("failed to decode spec for run {}", self.run_id))?;
        Ok(RunRecord {
            status: parse_status(&self.status, RunStatus::parse, "run status")?,
            spec,
            policy_json: self.policy_json,
            error: self.error.filter(|e| !e.is_empty()),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            run_id: self.run_id,
        })
    }
}

struct StepRow {
    index: u32,
    name: String,
    kind: String,
    action: Option<String>,
    command: String,
    blocking: bool,
    ticket: String,
    workspace: Option<String>,
    agent: Option<String>,
    status: String,
    error: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        let kind = match self.kind.as_str() {
            "shell" => {
                let action = self.action.as_deref().unwrap_or("");
                StepKind::Shell {
                    command: self.command,
                    action: parse_status(action, ShellAction::parse, "shell action")?,
                }
            }
            "tmux_start" => StepKind::TmuxStart {
                agent: self
                    .agent
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| anyhow!("tmux_start step {} has no agent", self.index))?,
            },
            other => bail!("unknown step kind {other:?}"),
        };
        Ok(Step {
            index: self.index,
            name: self.name,
            kind,
            blocking: self.blocking,
            ticket: self.ticket,
            workspace: self.workspace.filter(|w| !w.is_empty()),
            status: parse_status(&self.status, StepStatus::parse, "step status")?,
            error: self.error.filter(|e| !e.is_empty()),
            started_at: parse_ts_opt(self.started_at)?,
            finished_at: parse_ts_opt(self.finished_at)?,
        })
    }
}

struct AgentRow {
    run_id: String,
    name: String,
    workspace: String,
    session_name: String,
    status: String,
    health: String,
    last_activity_at: Option<String>,
    last_progress_at: Option<String>,
}

impl AgentRow {
    fn into_record(self) -> Result<AgentRecord> {
        Ok(AgentRecord {
            status: parse_status(&self.status, AgentStatus::parse, "agent status")?,
            health: parse_status(&self.health, HealthState::parse, "health state")?,
            last_activity_at: parse_ts_opt(self.last_activity_at)?,
            last_progress_at: parse_ts_opt(self.last_progress_at)?,
            run_id: self.run_id,
            name: self.name,
            workspace: self.workspace,
            session_name: self.session_name,
        })
    }
}

struct GuidanceRow {
    id: i64,
    run_id: String,
    workspace: String,
    agent: String,
    question: String,
    context: String,
    answer: Option<String>,
    status: String,
    created_at: String,
    answered_at: Option<String>,
}

impl GuidanceRow {
    fn into_request(self) -> Result<GuidanceRequest> {
        Ok(GuidanceRequest {
            status: parse_status(&self.status, GuidanceStatus::parse, "guidance status")?,
            created_at: parse_ts(&self.created_at)?,
            answered_at: parse_ts_opt(self.answered_at)?,
            answer: self.answer.filter(|a| !a.is_empty()),
            id: self.id,
            run_id: self.run_id,
            workspace: self.workspace,
            agent: self.agent,
            question: self.question,
            context: self.context,
        })
    }
}

const RUN_COLUMNS: &str =
    "run_id, status, spec_json, policy_json, error_text, created_at, updated_at";

fn run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        status: row.get(1)?,
        spec_json: row.get(2)?,
        policy_json: row.get(3)?,
        error: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const GUIDANCE_COLUMNS: &str = "id, run_id, workspace_name, agent_name, question, context_text, \
     answer_text, status, created_at, answered_at";

fn guidance_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GuidanceRow> {
    Ok(GuidanceRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        workspace: row.get(2)?,
        agent: row.get(3)?,
        question: row.get(4)?,
        context: row.get(5)?,
        answer: row.get(6)?,
        status: row.get(7)?,
        created_at: row.get(8)?,
        answered_at: row.get(9)?,
    })
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set journal_mode")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("failed to set busy_timeout")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            mode TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            policy_json TEXT NOT NULL,
            error_text TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS run_tickets (
            run_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            ticket TEXT NOT NULL,
            PRIMARY KEY (run_id, ticket)
        );
        CREATE TABLE IF NOT EXISTS steps (
            run_id TEXT NOT NULL,
            step_index INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            action TEXT,
            command_text TEXT NOT NULL DEFAULT '',
            blocking INTEGER NOT NULL,
            ticket TEXT NOT NULL DEFAULT '',
            workspace_name TEXT,
            agent_name TEXT,
            status TEXT NOT NULL,
            error_text TEXT,
            started_at TEXT,
            finished_at TEXT,
            PRIMARY KEY (run_id, step_index)
        );
        CREATE TABLE IF NOT EXISTS agents (
            run_id TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            workspace_name TEXT NOT NULL,
            session_name TEXT NOT NULL,
            status TEXT NOT NULL,
            health_state TEXT NOT NULL,
            last_activity_at TEXT,
            last_progress_at TEXT,
            PRIMARY KEY (run_id, agent_name, workspace_name)
        );
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            from_state TEXT NOT NULL DEFAULT '',
            to_state TEXT NOT NULL DEFAULT '',
            message TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_events_run ON events (run_id, id);
        CREATE TABLE IF NOT EXISTS run_briefs (
            run_id TEXT PRIMARY KEY,
            ticket TEXT NOT NULL,
            goal TEXT NOT NULL,
            scope TEXT NOT NULL,
            done_criteria TEXT NOT NULL,
            constraints_text TEXT NOT NULL,
            merge_intent TEXT NOT NULL,
            qa_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS guidance_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            workspace_name TEXT NOT NULL,
            agent_name TEXT NOT NULL,
            question TEXT NOT NULL,
            context_text TEXT NOT NULL DEFAULT '',
            answer_text TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            answered_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_guidance_run_status
            ON guidance_requests (run_id, status);
        CREATE TABLE IF NOT EXISTS run_locks (
            run_id TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure sqlite schema")?;
    Ok(())
}

impl Store for SqliteStore {
    fn create_run(&self, spec: &RunSpec, policy_json: &str) -> Result<()> {
        let spec_json = serde_json::to_string(spec).context("failed to encode run spec")?;
        let now = ts(spec.created_at);
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("begin create_run")?;
        tx.execute(
            "INSERT INTO runs (run_id, status, mode, spec_json, policy_json, error_text, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6)",
            params![
                spec.run_id,
                RunStatus::Created.as_str(),
                spec.mode.as_str(),
                spec_json,
                policy_json,
                now
            ],
        )
        .with_context(|| format!("failed to insert run {}", spec.run_id))?;
        for (position, ticket) in spec.tickets.iter().enumerate() {
            tx.execute(
                "INSERT OR IGNORE INTO run_tickets (run_id, position, ticket) VALUES (?1, ?2, ?3)",
                params![spec.run_id, position as i64, ticket],
            )
            .context("failed to insert run ticket")?;
        }
        tx.commit().context("commit create_run")?;
        debug!(run_id = %spec.run_id, "run persisted");
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                run_row,
            )
            .optional()
            .with_context(|| format!("failed to load run {run_id}"))?;
        row.map(RunRow::into_record).transpose()
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC, run_id DESC"
            ))
            .context("prepare list_runs")?;
        let rows = stmt
            .query_map([], run_row)
            .context("query list_runs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read list_runs")?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE runs SET status = ?2, error_text = ?3, updated_at = ?4 WHERE run_id = ?1",
                params![run_id, status.as_str(), non_empty(error), ts(at)],
            )
            .with_context(|| format!("failed to update run {run_id}"))?;
        if changed == 0 {
            bail!("run {run_id} not found");
        }
        Ok(())
    }

    fn save_steps(&self, run_id: &str, steps: &[Step]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("begin save_steps")?;
        tx.execute("DELETE FROM steps WHERE run_id = ?1", params![run_id])
            .context("failed to clear steps")?;
        for step in steps {
            let action = match &step.kind {
                StepKind::Shell { action, .. } => Some(action.as_str()),
                StepKind::TmuxStart { .. } => None,
            };
            tx.execute(
                "INSERT INTO steps (run_id, step_index, name, kind, action, command_text, blocking,
                     ticket, workspace_name, agent_name, status, error_text, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    run_id,
                    step.index,
                    step.name,
                    step.kind.label(),
                    action,
                    step.kind.command_text(),
                    step.blocking,
                    step.ticket,
                    step.workspace,
                    step.kind.agent(),
                    step.status.as_str(),
                    step.error,
                    ts_opt(step.started_at),
                    ts_opt(step.finished_at),
                ],
            )
            .with_context(|| format!("failed to insert step {}", step.index))?;
        }
        tx.commit().context("commit save_steps")?;
        Ok(())
    }

    fn get_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT step_index, name, kind, action, command_text, blocking, ticket,
                        workspace_name, agent_name, status, error_text, started_at, finished_at
                 FROM steps WHERE run_id = ?1 ORDER BY step_index ASC",
            )
            .context("prepare get_steps")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(StepRow {
                    index: row.get(0)?,
                    name: row.get(1)?,
                    kind: row.get(2)?,
                    action: row.get(3)?,
                    command: row.get(4)?,
                    blocking: row.get(5)?,
                    ticket: row.get(6)?,
                    workspace: row.get(7)?,
                    agent: row.get(8)?,
                    status: row.get(9)?,
                    error: row.get(10)?,
                    started_at: row.get(11)?,
                    finished_at: row.get(12)?,
                })
            })
            .context("query get_steps")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read get_steps")?;
        rows.into_iter().map(StepRow::into_step).collect()
    }

    fn update_step_status(
        &self,
        run_id: &str,
        index: u32,
        status: StepStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let now = ts(at);
        let conn = self.conn()?;
        let changed = match status {
            StepStatus::Running => conn.execute(
                "UPDATE steps SET status = ?3, error_text = ?4, started_at = ?5, finished_at = NULL
                 WHERE run_id = ?1 AND step_index = ?2",
                params![run_id, index, status.as_str(), non_empty(error), now],
            ),
            StepStatus::Pending => conn.execute(
                "UPDATE steps SET status = ?3, error_text = ?4
                 WHERE run_id = ?1 AND step_index = ?2",
                params![run_id, index, status.as_str(), non_empty(error)],
            ),
            StepStatus::Done | StepStatus::Failed | StepStatus::Skipped => conn.execute(
                "UPDATE steps SET status = ?3, error_text = ?4, finished_at = ?5
                 WHERE run_id = ?1 AND step_index = ?2",
                params![run_id, index, status.as_str(), non_empty(error), now],
            ),
        }
        .with_context(|| format!("failed to update step {index} of run {run_id}"))?;
        if changed == 0 {
            bail!("step {index} of run {run_id} not found");
        }
        Ok(())
    }

    fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO agents (run_id, agent_name, workspace_name, session_name, status,
                 health_state, last_activity_at, last_progress_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (run_id, agent_name, workspace_name) DO UPDATE SET
                 session_name = excluded.session_name,
                 status = excluded.status,
                 health_state = excluded.health_state,
                 last_activity_at = excluded.last_activity_at,
                 last_progress_at = excluded.last_progress_at",
            params![
                agent.run_id,
                agent.name,
                agent.workspace,
                agent.session_name,
                agent.status.as_str(),
                agent.health.as_str(),
                ts_opt(agent.last_activity_at),
                ts_opt(agent.last_progress_at),
            ],
        )
        .with_context(|| format!("failed to upsert agent {}@{}", agent.name, agent.workspace))?;
        Ok(())
    }

    fn get_agents(&self, run_id: &str) -> Result<Vec<AgentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, agent_name, workspace_name, session_name, status, health_state,
                        last_activity_at, last_progress_at
                 FROM agents WHERE run_id = ?1 ORDER BY workspace_name, agent_name",
            )
            .context("prepare get_agents")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(AgentRow {
                    run_id: row.get(0)?,
                    name: row.get(1)?,
                    workspace: row.get(2)?,
                    session_name: row.get(3)?,
                    status: row.get(4)?,
                    health: row.get(5)?,
                    last_activity_at: row.get(6)?,
                    last_progress_at: row.get(7)?,
                })
            })
            .context("query get_agents")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read get_agents")?;
        rows.into_iter().map(AgentRow::into_record).collect()
    }

    fn add_event(&self, event: &NewEvent, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (run_id, entity_type, entity_id, event_type, from_state, to_state,
                 message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.run_id,
                event.entity_type,
                event.entity_id,
                event.event_type,
                event.from_state,
                event.to_state,
                event.message,
                ts(at),
            ],
        )
        .context("failed to append event")?;
        Ok(())
    }

    fn list_events(&self, run_id: &str) -> Result<Vec<LifecycleEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, entity_type, entity_id, event_type, from_state, to_state,
                        message, created_at
                 FROM events WHERE run_id = ?1 ORDER BY id ASC",
            )
            .context("prepare list_events")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .context("query list_events")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read list_events")?;
        rows.into_iter()
            .map(
                |(id, run_id, entity_type, entity_id, event_type, from_state, to_state, message, at)| {
                    Ok(LifecycleEvent {
                        id,
                        run_id,
                        entity_type,
                        entity_id,
                        event_type,
                        from_state,
                        to_state,
                        message,
                        created_at: parse_ts(&at)?,
                    })
                },
            )
            .collect()
    }

    fn upsert_brief(&self, brief: &RunBrief) -> Result<()> {
        let qa_json = serde_json::to_string(&brief.qa).context("failed to encode intake qa")?;
        let conn = self.conn()?;
        // The intake itself is immutable; a second write only bumps updated_at.
        conn.execute(
            "INSERT INTO run_briefs (run_id, ticket, goal, scope, done_criteria, constraints_text,
                 merge_intent, qa_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (run_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![
                brief.run_id,
                brief.ticket,
                brief.goal,
                brief.scope,
                brief.done_criteria,
                brief.constraints,
                brief.merge_intent,
                qa_json,
                ts(brief.created_at),
                ts(brief.updated_at),
            ],
        )
        .with_context(|| format!("failed to store brief for run {}", brief.run_id))?;
        Ok(())
    }

    fn get_brief(&self, run_id: &str) -> Result<Option<RunBrief>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT run_id, ticket, goal, scope, done_criteria, constraints_text, merge_intent,
                        qa_json, created_at, updated_at
                 FROM run_briefs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load brief for run {run_id}"))?;
        let Some((run_id, ticket, goal, scope, done, constraints, merge, qa_json, created, updated)) =
            row
        else {
            return Ok(None);
        };
        let qa: Vec<IntakeQa> =
            serde_json::from_str(&qa_json).context("failed to decode intake qa")?;
        Ok(Some(RunBrief {
            run_id,
            ticket,
            goal,
            scope,
            done_criteria: done,
            constraints,
            merge_intent: merge,
            qa,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        }))
    }

    fn add_guidance_request(&self, request: &NewGuidanceRequest) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO guidance_requests (run_id, workspace_name, agent_name, question,
                 context_text, answer_text, status, created_at, answered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, NULL)",
            params![
                request.run_id,
                request.workspace,
                request.agent,
                request.question,
                request.context,
                GuidanceStatus::Pending.as_str(),
                ts(request.created_at),
            ],
        )
        .context("failed to insert guidance request")?;
        Ok(conn.last_insert_rowid())
    }

    fn list_guidance(
        &self,
        run_id: &str,
        status: Option<GuidanceStatus>,
    ) -> Result<Vec<GuidanceRequest>> {
        let conn = self.conn()?;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {GUIDANCE_COLUMNS} FROM guidance_requests
                         WHERE run_id = ?1 AND status = ?2 ORDER BY id ASC"
                    ))
                    .context("prepare list_guidance")?;
                let rows = stmt
                    .query_map(params![run_id, status.as_str()], guidance_row)
                    .context("query list_guidance")?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {GUIDANCE_COLUMNS} FROM guidance_requests
                         WHERE run_id = ?1 ORDER BY id ASC"
                    ))
                    .context("prepare list_guidance")?;
                let rows = stmt
                    .query_map(params![run_id], guidance_row)
                    .context("query list_guidance")?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        }
        .context("read list_guidance")?;
        rows.into_iter().map(GuidanceRow::into_request).collect()
    }

    fn mark_guidance_answered(&self, id: i64, answer: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE guidance_requests SET answer_text = ?2, status = ?3, answered_at = ?4
                 WHERE id = ?1",
                params![id, answer, GuidanceStatus::Answered.as_str(), ts(at)],
            )
            .with_context(|| format!("failed to answer guidance request {id}"))?;
        if changed == 0 {
            bail!("guidance request {id} not found");
        }
        Ok(())
    }

    fn try_acquire_run_lock(
        &self,
        run_id: &str,
        token: &str,
        holder: &str,
        at: DateTime<Utc>,
    ) -> Result<LockAttempt> {
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO run_locks (run_id, token, holder, acquired_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![run_id, token, holder, ts(at)],
            )
            .with_context(|| format!("failed to lock run {run_id}"))?;
        if inserted == 1 {
            return Ok(LockAttempt::Acquired);
        }
        let holder: String = conn
            .query_row(
                "SELECT holder FROM run_locks WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read run lock holder")?
            .unwrap_or_default();
        Ok(LockAttempt::Held { holder })
    }

    fn release_run_lock(&self, run_id: &str, token: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM run_locks WHERE run_id = ?1 AND token = ?2",
            params![run_id, token],
        )
        .with_context(|| format!("failed to unlock run {run_id}"))?;
        Ok(())
    }

    fn force_release_run_lock(&self, run_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM run_locks WHERE run_id = ?1", params![run_id])
            .with_context(|| format!("failed to unlock run {run_id}"))?;
        Ok(removed > 0)
    }
}
