//! Shell command port used by plan steps and close/cleanup actions.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

pub trait CommandRunner {
    /// Run `command` through a login shell and return combined output.
    ///
    /// A non-zero exit is an error carrying that output.
    fn run(&self, command: &str, workdir: Option<&Path>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, workdir: Option<&Path>) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.args(["-lc", command]);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn `{command}`"))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let text = text.trim().to_string();
        debug!(command, status = ?output.status.code(), "shell command finished");

        if !output.status.success() {
            let status = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            if text.is_empty() {
                bail!("`{command}` exited with status {status}");
            }
            bail!("`{command}` exited with status {status}: {text}");
        }
        Ok(text)
    }
}
