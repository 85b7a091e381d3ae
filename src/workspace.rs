//! Workspace name to filesystem path resolution.
//!
//! `wsm` keeps one JSON file per workspace under
//! `$XDG_CONFIG_HOME/workspace-manager/workspaces/<name>.json` (falling back to
//! `$HOME/.config`). Only the `path` field matters here.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

pub trait WorkspaceResolver {
    fn resolve(&self, workspace: &str) -> Result<PathBuf>;
}

#[derive(Debug, Deserialize)]
struct WorkspaceEntry {
    #[serde(default)]
    path: String,
}

/// Reads the workspace-manager registry from disk.
#[derive(Debug, Clone)]
pub struct WorkspaceRegistry {
    config_root: PathBuf,
}

impl WorkspaceRegistry {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let root = config_root_from(
            std::env::var_os("XDG_CONFIG_HOME"),
            std::env::var_os("HOME"),
        )?;
        Ok(Self::new(root))
    }

    pub fn entry_path(&self, workspace: &str) -> PathBuf {
        self.config_root
            .join("workspace-manager")
            .join("workspaces")
            .join(format!("{workspace}.json"))
    }
}

fn config_root_from(xdg: Option<OsString>, home: Option<OsString>) -> Result<PathBuf> {
    if let Some(xdg) = xdg.filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg));
    }
    match home.filter(|v| !v.is_empty()) {
        Some(home) => Ok(Path::new(&home).join(".config")),
        None => bail!("neither XDG_CONFIG_HOME nor HOME is set"),
    }
}

impl WorkspaceResolver for WorkspaceRegistry {
    fn resolve(&self, workspace: &str) -> Result<PathBuf> {
        let workspace = workspace.trim();
        if workspace.is_empty() {
            bail!("workspace name is empty");
        }
        let entry_path = self.entry_path(workspace);
        let raw = std::fs::read_to_string(&entry_path).with_context(|| {
            format!(
                "workspace {workspace} not found in registry ({})",
                entry_path.display()
            )
        })?;
        let entry: WorkspaceEntry = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", entry_path.display()))?;
        let path = entry.path.trim();
        if path.is_empty() {
            bail!("workspace {workspace} has no path in {}", entry_path.display());
        }
        Ok(PathBuf::from(path))
    }
}
