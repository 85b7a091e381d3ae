//! Workspace signal files.
//!
//! Agents talk back to the engine by dropping JSON files into
//! `<workspace>/.metawsm/`. A missing file reads as `None`; a malformed one is
//! an error so callers can decide whether to skip it or block on it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

pub const SIGNAL_DIR: &str = ".metawsm";
pub const GUIDANCE_REQUEST_FILE: &str = "guidance-request.json";
pub const GUIDANCE_RESPONSE_FILE: &str = "guidance-response.json";
pub const COMPLETION_FILE: &str = "implementation-complete.json";
pub const VALIDATION_FILE: &str = "validation-result.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GuidanceRequestSignal {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub question: String,
    /// Free text, or any JSON value flattened to compact JSON text.
    #[serde(default, deserialize_with = "context_text")]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceResponseSignal {
    pub guidance_id: i64,
    pub run_id: String,
    pub agent: String,
    pub question: String,
    pub answer: String,
    pub answered_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompletionSignal {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ValidationSignal {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub done_criteria: String,
}

impl GuidanceRequestSignal {
    /// Whether this request belongs to `run_id`.
    pub fn matches_run(&self, run_id: &str) -> bool {
        scoped(&self.run_id, run_id)
    }
}

impl CompletionSignal {
    pub fn matches(&self, run_id: &str, agent: &str) -> bool {
        scoped(&self.run_id, run_id) && scoped(&self.agent, agent)
    }
}

impl ValidationSignal {
    pub fn matches_run(&self, run_id: &str) -> bool {
        scoped(&self.run_id, run_id)
    }

    pub fn passed(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case("passed")
    }
}

impl GuidanceResponseSignal {
    pub fn new(
        guidance_id: i64,
        run_id: &str,
        agent: &str,
        question: &str,
        answer: &str,
        answered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            guidance_id,
            run_id: run_id.to_string(),
            agent: agent.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
            answered_at: answered_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Blank means "any"; otherwise the value must match exactly.
fn scoped(value: &str, expected: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value == expected
}

fn context_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.trim().to_string(),
        other => other.to_string(),
    })
}

pub fn signal_path(workspace_path: &Path, file: &str) -> PathBuf {
    workspace_path.join(SIGNAL_DIR).join(file)
}

fn read_signal<T: DeserializeOwned>(workspace_path: &Path, file: &str) -> Result<Option<T>> {
    let path = signal_path(workspace_path, file);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Pending guidance request, ignoring files without a question.
pub fn read_guidance_request(workspace_path: &Path) -> Result<Option<GuidanceRequestSignal>> {
    let signal: Option<GuidanceRequestSignal> = read_signal(workspace_path, GUIDANCE_REQUEST_FILE)?;
    Ok(signal
        .map(|mut signal| {
            signal.run_id = signal.run_id.trim().to_string();
            signal.agent = signal.agent.trim().to_string();
            signal.question = signal.question.trim().to_string();
            signal
        })
        .filter(|signal| !signal.question.is_empty()))
}

pub fn read_completion(workspace_path: &Path) -> Result<Option<CompletionSignal>> {
    read_signal(workspace_path, COMPLETION_FILE)
}

pub fn read_validation(workspace_path: &Path) -> Result<Option<ValidationSignal>> {
    read_signal(workspace_path, VALIDATION_FILE)
}

/// Write the operator's answer where the agent polls for it.
pub fn write_guidance_response(
    workspace_path: &Path,
    response: &GuidanceResponseSignal,
) -> Result<PathBuf> {
    let path = signal_path(workspace_path, GUIDANCE_RESPONSE_FILE);
    let mut buf = serde_json::to_string_pretty(response).context("encode guidance response")?;
    buf.push('\n');
    write_atomic(&path, &buf)?;
    debug!(path = %path.display(), guidance_id = response.guidance_id, "wrote guidance response");
    Ok(path)
}

/// Remove the request file once answered; already-gone is fine.
pub fn clear_guidance_request(workspace_path: &Path) -> Result<()> {
    let path = signal_path(workspace_path, GUIDANCE_REQUEST_FILE);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("signal path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp signal {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace signal {}", path.display()))?;
    Ok(())
}
