//! tmux session management for agent sessions.
//!
//! The orchestrator only sees the [`SessionRunner`] trait; [`TmuxRunner`]
//! shells out to the tmux CLI. Every agent command runs inside a wrapper that
//! prints its exit status to the pane and then drops to an interactive shell,
//! so a finished agent leaves a readable session behind.

use std::path::Path;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::health::{SessionProbe, parse_exit_status};
use crate::plan::shell_quote;

/// Pane lines inspected when looking for the wrapper's exit line.
pub const EXIT_SCAN_LINES: u32 = 200;

const MISSING_SESSION_MESSAGES: &[&str] = &[
    "can't find session",
    "no server running",
    "no such file or directory",
    "no sessions",
];

const KILL_TOLERATED_MESSAGES: &[&str] = &[
    "no server running",
    "can't find session",
    "error connecting",
];

/// Session runner port.
pub trait SessionRunner {
    /// `Ok(false)` when tmux reports the session (or server) missing.
    fn has_session(&self, session: &str) -> Result<bool>;
    /// Start `command` detached in a new session rooted at `workdir`.
    fn start(&self, session: &str, workdir: &Path, command: &str) -> Result<()>;
    /// Kill a session; an already-gone session is success.
    fn kill(&self, session: &str) -> Result<()>;
    /// Epoch seconds of the session's last activity.
    fn activity_epoch(&self, session: &str) -> Result<i64>;
    /// Last `lines` lines of the session's first window.
    fn capture_tail(&self, session: &str, lines: u32) -> Result<String>;
}

/// Observe a session without failing: runner errors become [`SessionProbe::Unknown`].
pub fn probe_session(runner: &dyn SessionRunner, session: &str) -> SessionProbe {
    match runner.has_session(session) {
        Ok(true) => {}
        Ok(false) => return SessionProbe::Missing,
        Err(err) => {
            debug!(session, error = %format!("{err:#}"), "session probe failed");
            return SessionProbe::Unknown;
        }
    }
    let activity_epoch = runner.activity_epoch(session).unwrap_or(0);
    let exit_code = runner
        .capture_tail(session, EXIT_SCAN_LINES)
        .ok()
        .and_then(|pane| parse_exit_status(&pane));
    SessionProbe::Alive {
        activity_epoch,
        exit_code,
    }
}

/// Blank commands become `bash`; `codex exec` runs outside git checks.
pub fn normalize_agent_command(command: &str) -> String {
    let command = command.trim();
    if command.is_empty() {
        return "bash".to_string();
    }
    if let Some(rest) = command.strip_prefix("codex exec") {
        let is_exec = rest.is_empty() || rest.starts_with(' ');
        if is_exec && !command.contains("--skip-git-repo-check") {
            return format!("codex exec --skip-git-repo-check{rest}");
        }
    }
    command.to_string()
}

/// Wrap an agent command so its exit status lands in the pane.
pub fn wrap_agent_command(command: &str) -> String {
    let script = format!(
        "{}; status=$?; printf '\\n[metawsm] agent command exited with status %s at %s\\n' \
         \"$status\" \"$(date -Iseconds)\"; exec bash",
        normalize_agent_command(command)
    );
    format!("bash -lc {}", shell_quote(&script))
}

/// Shell form of [`SessionRunner::start`], as shown in dry-run action lists.
pub fn start_command_text(session: &str, workdir: &Path, wrapped: &str) -> String {
    format!(
        "tmux new-session -d -s {} -c {} {}",
        shell_quote(session),
        shell_quote(&workdir.display().to_string()),
        shell_quote(wrapped)
    )
}

pub fn kill_command_text(session: &str) -> String {
    format!("tmux kill-session -t {}", shell_quote(session))
}

pub fn is_missing_session_message(text: &str) -> bool {
    contains_any(text, MISSING_SESSION_MESSAGES)
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    needles.iter().any(|needle| lowered.contains(needle))
}

fn run_tmux<I, S>(args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    Command::new("tmux")
        .args(args)
        .output()
        .context("failed to run tmux command")
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// [`SessionRunner`] backed by the tmux binary on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TmuxRunner;

impl SessionRunner for TmuxRunner {
    fn has_session(&self, session: &str) -> Result<bool> {
        let output = run_tmux(["has-session", "-t", session])?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_text(&output);
        if is_missing_session_message(&stderr) || stderr.is_empty() {
            return Ok(false);
        }
        bail!("tmux has-session failed for '{session}': {stderr}");
    }

    fn start(&self, session: &str, workdir: &Path, command: &str) -> Result<()> {
        let output = Command::new("tmux")
            .args(["new-session", "-d", "-s", session, "-c"])
            .arg(workdir)
            .arg(command)
            .output()
            .with_context(|| format!("failed to create tmux session '{session}'"))?;
        if !output.status.success() {
            bail!("tmux new-session failed: {}", stderr_text(&output));
        }
        info!(session, workdir = %workdir.display(), "tmux session created");
        Ok(())
    }

    fn kill(&self, session: &str) -> Result<()> {
        let output = run_tmux(["kill-session", "-t", session])
            .with_context(|| format!("failed to kill tmux session '{session}'"))?;
        if output.status.success() {
            info!(session, "tmux session killed");
            return Ok(());
        }
        let stderr = stderr_text(&output);
        if contains_any(&stderr, KILL_TOLERATED_MESSAGES) {
            debug!(session, "tmux session already gone");
            return Ok(());
        }
        bail!("tmux kill-session failed: {stderr}");
    }

    fn activity_epoch(&self, session: &str) -> Result<i64> {
        let output = run_tmux(["display-message", "-p", "-t", session, "#{session_activity}"])?;
        if !output.status.success() {
            bail!("tmux display-message failed: {}", stderr_text(&output));
        }
        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        raw.parse::<i64>()
            .with_context(|| format!("unexpected session_activity value {raw:?}"))
    }

    fn capture_tail(&self, session: &str, lines: u32) -> Result<String> {
        let target = format!("{session}:0");
        let start = format!("-{lines}");
        let output = run_tmux(["capture-pane", "-p", "-t", target.as_str(), "-S", start.as_str()])
            .with_context(|| format!("failed to capture pane for target '{target}'"))?;
        if !output.status.success() {
            bail!("tmux capture-pane failed: {}", stderr_text(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
