//! Run, step, agent, and guidance records shared by the engine and its ports.
//!
//! Every status enum has a stable lower-case string form. That form is what
//! lands in the database, in lifecycle events, and in `metawsm status` output,
//! so renaming a variant's string is a storage migration.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Option<Self> {
                match value.trim() {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Lifecycle status of a run.
    RunStatus {
        Created => "created",
        Planning => "planning",
        Running => "running",
        AwaitingGuidance => "awaiting_guidance",
        Paused => "paused",
        Failed => "failed",
        Stopping => "stopping",
        Stopped => "stopped",
        Closing => "closing",
        Closed => "closed",
        Completed => "completed",
    }
}

string_enum! {
    StepStatus {
        Pending => "pending",
        Running => "running",
        Done => "done",
        Failed => "failed",
        Skipped => "skipped",
    }
}

string_enum! {
    AgentStatus {
        Pending => "pending",
        Running => "running",
        Idle => "idle",
        Stalled => "stalled",
        Dead => "dead",
        Stopping => "stopping",
        Stopped => "stopped",
        Failed => "failed",
    }
}

string_enum! {
    /// Health derived from session telemetry; never authored directly.
    HealthState {
        Healthy => "healthy",
        Idle => "idle",
        Stalled => "stalled",
        Dead => "dead",
    }
}

string_enum! {
    RunMode {
        Standard => "run",
        Bootstrap => "bootstrap",
    }
}

string_enum! {
    /// How the workspace for each ticket is obtained.
    WorkspaceStrategy {
        Create => "create",
        Fork => "fork",
        Reuse => "reuse",
    }
}

string_enum! {
    GuidanceStatus {
        Pending => "pending",
        Answered => "answered",
    }
}

impl StepStatus {
    /// Steps the executor never revisits.
    pub fn is_settled(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped)
    }
}

/// One entry in a run's agent roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub command: String,
}

/// Everything needed to rebuild and replay a run's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub run_id: String,
    pub mode: RunMode,
    pub tickets: Vec<String>,
    pub repos: Vec<String>,
    pub workspace_strategy: WorkspaceStrategy,
    pub base_branch: String,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl RunSpec {
    pub fn agent_command(&self, agent: &str) -> Option<&str> {
        self.agents
            .iter()
            .find(|spec| spec.name == agent)
            .map(|spec| spec.command.as_str())
    }
}

/// Persisted run header together with its spec and policy snapshot.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub spec: RunSpec,
    pub policy_json: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a shell step does besides running its command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellAction {
    VerifyTicket,
    ProvisionWorkspace(WorkspaceStrategy),
}

impl ShellAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ShellAction::VerifyTicket => "verify_ticket",
            ShellAction::ProvisionWorkspace(WorkspaceStrategy::Create) => "workspace_create",
            ShellAction::ProvisionWorkspace(WorkspaceStrategy::Fork) => "workspace_fork",
            ShellAction::ProvisionWorkspace(WorkspaceStrategy::Reuse) => "workspace_reuse",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "verify_ticket" => Some(ShellAction::VerifyTicket),
            "workspace_create" => Some(ShellAction::ProvisionWorkspace(WorkspaceStrategy::Create)),
            "workspace_fork" => Some(ShellAction::ProvisionWorkspace(WorkspaceStrategy::Fork)),
            "workspace_reuse" => Some(ShellAction::ProvisionWorkspace(WorkspaceStrategy::Reuse)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Shell { command: String, action: ShellAction },
    TmuxStart { agent: String },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Shell { .. } => "shell",
            StepKind::TmuxStart { .. } => "tmux_start",
        }
    }

    pub fn command_text(&self) -> &str {
        match self {
            StepKind::Shell { command, .. } => command,
            StepKind::TmuxStart { .. } => "",
        }
    }

    pub fn agent(&self) -> Option<&str> {
        match self {
            StepKind::Shell { .. } => None,
            StepKind::TmuxStart { agent } => Some(agent),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// 1-based, stable across resumes.
    pub index: u32,
    pub name: String,
    pub kind: StepKind,
    pub blocking: bool,
    pub ticket: String,
    pub workspace: Option<String>,
    pub status: StepStatus,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn pending(index: u32, name: String, kind: StepKind, ticket: &str) -> Self {
        Self {
            index,
            name,
            kind,
            blocking: true,
            ticket: ticket.to_string(),
            workspace: None,
            status: StepStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = Some(workspace.to_string());
        self
    }
}

/// Agent session keyed by (run, agent name, workspace).
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub run_id: String,
    pub name: String,
    pub workspace: String,
    pub session_name: String,
    pub status: AgentStatus,
    pub health: HealthState,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeQa {
    pub question: String,
    pub answer: String,
}

/// Bootstrap intake; immutable after creation except `updated_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunBrief {
    pub run_id: String,
    pub ticket: String,
    pub goal: String,
    pub scope: String,
    pub done_criteria: String,
    pub constraints: String,
    pub merge_intent: String,
    pub qa: Vec<IntakeQa>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceRequest {
    pub id: i64,
    pub run_id: String,
    pub workspace: String,
    pub agent: String,
    pub question: String,
    pub context: String,
    pub answer: Option<String>,
    pub status: GuidanceStatus,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

impl GuidanceRequest {
    /// Dedupe key: a signal file persists until cleared, so polls must not
    /// insert the same question twice.
    pub fn key(&self) -> String {
        guidance_key(&self.workspace, &self.agent, &self.question)
    }
}

pub fn guidance_key(workspace: &str, agent: &str, question: &str) -> String {
    format!("{workspace}|{agent}|{}", question.trim())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGuidanceRequest {
    pub run_id: String,
    pub workspace: String,
    pub agent: String,
    pub question: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub id: i64,
    pub run_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: String,
    pub from_state: String,
    pub to_state: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub run_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: String,
    pub from_state: String,
    pub to_state: String,
    pub message: String,
}

impl NewEvent {
    pub fn new(run_id: &str, entity_type: &str, entity_id: &str, event_type: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            event_type: event_type.to_string(),
            from_state: String::new(),
            to_state: String::new(),
            message: String::new(),
        }
    }

    pub fn states(mut self, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        self.from_state = from.to_string();
        self.to_state = to.to_string();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}
