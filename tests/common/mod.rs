#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use metawsm::config::PolicyConfig;
use metawsm::git::GitInspector;
use metawsm::orchestrator::ExecutorTiming;
use metawsm::shell::CommandRunner;
use metawsm::store::SqliteStore;
use metawsm::tmux::SessionRunner;
use metawsm::workspace::WorkspaceResolver;
use metawsm::{Orchestrator, Ports};

pub const RUN_ID: &str = "run-1";

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

#[derive(Default)]
pub struct SessionState {
    pub live: HashSet<String>,
    pub log: Vec<String>,
    /// Sessions that vanish right after start.
    pub die_on_start: HashSet<String>,
    pub panes: HashMap<String, String>,
    /// When set, session lookups fail without saying whether the session exists.
    pub tmux_unreachable: bool,
}

#[derive(Clone, Default)]
pub struct FakeSessions(pub Rc<RefCell<SessionState>>);

impl SessionRunner for FakeSessions {
    fn has_session(&self, session: &str) -> Result<bool> {
        let state = self.0.borrow();
        if state.tmux_unreachable {
            bail!("tmux server not responding");
        }
        Ok(state.live.contains(session))
    }

    fn start(&self, session: &str, workdir: &Path, _command: &str) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.log.push(format!("start {session} {}", workdir.display()));
        if !state.die_on_start.contains(session) {
            state.live.insert(session.to_string());
        }
        Ok(())
    }

    fn kill(&self, session: &str) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.log.push(format!("kill {session}"));
        state.live.remove(session);
        Ok(())
    }

    fn activity_epoch(&self, _session: &str) -> Result<i64> {
        Ok(fixed_now().timestamp())
    }

    fn capture_tail(&self, session: &str, _lines: u32) -> Result<String> {
        Ok(self.0.borrow().panes.get(session).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct CommandState {
    pub log: Vec<String>,
    /// Commands containing the key fail with the value as error text.
    pub failures: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub struct RecordingCommands(pub Rc<RefCell<CommandState>>);

impl RecordingCommands {
    pub fn fail_when(&self, needle: &str, message: &str) {
        self.0
            .borrow_mut()
            .failures
            .push((needle.to_string(), message.to_string()));
    }

    pub fn log(&self) -> Vec<String> {
        self.0.borrow().log.clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.0.borrow().log.iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for RecordingCommands {
    fn run(&self, command: &str, _workdir: Option<&Path>) -> Result<String> {
        let mut state = self.0.borrow_mut();
        state.log.push(command.to_string());
        if let Some((_, message)) = state
            .failures
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            bail!("`{command}` exited with status 1: {message}");
        }
        Ok(String::new())
    }
}

/// Resolves every workspace to a directory under a temp root.
#[derive(Clone)]
pub struct DirWorkspaces {
    pub root: PathBuf,
}

impl DirWorkspaces {
    pub fn path(&self, workspace: &str) -> PathBuf {
        self.root.join(workspace)
    }
}

impl WorkspaceResolver for DirWorkspaces {
    fn resolve(&self, workspace: &str) -> Result<PathBuf> {
        let path = self.path(workspace);
        fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[derive(Clone, Default)]
pub struct FakeGit {
    pub dirty: Rc<RefCell<HashSet<PathBuf>>>,
    pub resets: Rc<RefCell<Vec<String>>>,
}

impl GitInspector for FakeGit {
    fn is_repo(&self, _path: &Path) -> bool {
        false
    }

    fn is_dirty(&self, repo: &Path) -> Result<bool> {
        Ok(self.dirty.borrow().contains(repo))
    }

    fn ref_exists(&self, _repo: &Path, full_ref: &str) -> Result<bool> {
        Ok(full_ref.starts_with("refs/remotes/origin/"))
    }

    fn fetch(&self, _repo: &Path, _remote: &str, _branch: &str) -> Result<()> {
        Err(anyhow!("offline"))
    }

    fn reset_hard(&self, repo: &Path, target: &str) -> Result<()> {
        self.resets
            .borrow_mut()
            .push(format!("{} {target}", repo.display()));
        Ok(())
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub sessions: FakeSessions,
    pub commands: RecordingCommands,
    pub workspaces: DirWorkspaces,
    pub git: FakeGit,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let workspaces = DirWorkspaces {
            root: tmp.path().join("workspaces"),
        };
        Self {
            tmp,
            sessions: FakeSessions::default(),
            commands: RecordingCommands::default(),
            workspaces,
            git: FakeGit::default(),
        }
    }

    pub fn orchestrator(&self, policy: PolicyConfig) -> Orchestrator {
        self.orchestrator_with_store(policy, SqliteStore::open_in_memory().unwrap())
    }

    pub fn orchestrator_with_store(&self, policy: PolicyConfig, store: SqliteStore) -> Orchestrator {
        let ports = Ports {
            store: Box::new(store),
            sessions: Box::new(self.sessions.clone()),
            commands: Box::new(self.commands.clone()),
            workspaces: Box::new(self.workspaces.clone()),
            git: Box::new(self.git.clone()),
        };
        Orchestrator::new(policy, ports)
            .with_timing(ExecutorTiming::immediate())
            .with_clock(fixed_now)
    }

    /// Write a signal file into a workspace's `.metawsm/` directory.
    pub fn write_signal(&self, workspace: &str, file: &str, json: &str) {
        let dir = self.workspaces.path(workspace).join(".metawsm");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), json).unwrap();
    }
}
