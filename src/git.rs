//! Git inspection for workspace repos: base-branch alignment after
//! provisioning and the clean-tree gate before close.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

pub trait GitInspector {
    fn is_repo(&self, path: &Path) -> bool;
    fn is_dirty(&self, repo: &Path) -> Result<bool>;
    fn ref_exists(&self, repo: &Path, full_ref: &str) -> Result<bool>;
    fn fetch(&self, repo: &Path, remote: &str, branch: &str) -> Result<()>;
    fn reset_hard(&self, repo: &Path, target: &str) -> Result<()>;
}

/// Repos inside a workspace: `<workspace>/<repo>` for each listed repo, or the
/// workspace itself when it is a checkout and no repos are listed.
pub fn workspace_repo_paths(
    git: &dyn GitInspector,
    workspace_path: &Path,
    repos: &[String],
) -> Vec<PathBuf> {
    let listed: Vec<PathBuf> = repos
        .iter()
        .map(|repo| repo.trim())
        .filter(|repo| !repo.is_empty())
        .map(|repo| workspace_path.join(repo))
        .collect();
    if listed.is_empty() && git.is_repo(workspace_path) {
        return vec![workspace_path.to_path_buf()];
    }
    listed
}

/// Hard-reset every workspace repo onto `base_branch`.
///
/// Prefers `origin/<base>` after a best-effort fetch, then a local `<base>`.
pub fn align_to_base(
    git: &dyn GitInspector,
    workspace_path: &Path,
    repos: &[String],
    base_branch: &str,
) -> Result<()> {
    for repo in workspace_repo_paths(git, workspace_path, repos) {
        if let Err(err) = git.fetch(&repo, "origin", base_branch) {
            warn!(repo = %repo.display(), error = %format!("{err:#}"), "fetch failed; using local refs");
        }
        let target = if git.ref_exists(&repo, &format!("refs/remotes/origin/{base_branch}"))? {
            format!("origin/{base_branch}")
        } else if git.ref_exists(&repo, &format!("refs/heads/{base_branch}"))? {
            base_branch.to_string()
        } else {
            bail!(
                "base branch {base_branch:?} not found for repo {}",
                repo.display()
            );
        };
        git.reset_hard(&repo, &target)?;
        debug!(repo = %repo.display(), target, "repo aligned to base branch");
    }
    Ok(())
}

fn run_git<I, S>(repo_root: &Path, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("git")
        .current_dir(repo_root)
        .args(args)
        .output()
        .with_context(|| format!("failed to run git in {}", repo_root.display()))
}

/// [`GitInspector`] backed by the git binary on `PATH`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

impl GitInspector for GitCli {
    fn is_repo(&self, path: &Path) -> bool {
        if !path.is_dir() {
            return false;
        }
        run_git(path, ["rev-parse", "--is-inside-work-tree"])
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
            .unwrap_or(false)
    }

    fn is_dirty(&self, repo: &Path) -> Result<bool> {
        let output = run_git(repo, ["status", "--porcelain"])?;
        if !output.status.success() {
            bail!(
                "git status failed in {}: {}",
                repo.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn ref_exists(&self, repo: &Path, full_ref: &str) -> Result<bool> {
        let output = run_git(repo, ["show-ref", "--verify", "--quiet", full_ref])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => bail!(
                "failed to check ref '{}': {}",
                full_ref,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }

    fn fetch(&self, repo: &Path, remote: &str, branch: &str) -> Result<()> {
        let output = run_git(repo, ["fetch", remote, branch])?;
        if !output.status.success() {
            bail!(
                "git fetch {remote} {branch} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn reset_hard(&self, repo: &Path, target: &str) -> Result<()> {
        let output = run_git(repo, ["reset", "--hard", target])?;
        if !output.status.success() {
            bail!(
                "git reset --hard {target} failed in {}: {}",
                repo.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
