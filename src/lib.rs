//! Run orchestration for multi-agent, multi-workspace ticket work.
//!
//! A run provisions one workspace per ticket, starts one tmux session per
//! agent and workspace, and walks a persisted plan that survives restarts.
//! Bootstrap runs additionally talk to their agents through signal files.

pub mod config;
pub mod error;
pub mod git;
pub mod health;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod policy;
pub mod shell;
pub mod signals;
pub mod store;
pub mod tmux;
pub mod transitions;
pub mod workspace;

pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, Ports};
