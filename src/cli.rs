use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use metawsm::model::WorkspaceStrategy;

#[derive(Parser, Debug)]
#[command(
    name = "metawsm",
    about = "Orchestrate agent sessions across ticket workspaces",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Policy file (default: nearest .metawsm/policy.toml)
    #[arg(long, global = true)]
    pub policy: Option<PathBuf>,

    /// Run database (default: .metawsm/metawsm.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan and execute a standard run
    Run(RunArgs),

    /// Start a bootstrap run that waits for agent signals
    Bootstrap {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        brief: BriefArgs,
    },

    /// Continue a paused, failed, or stopped run
    Resume(RunSelector),

    /// Kill a run's sessions and mark it stopped
    Stop(RunSelector),

    /// Restart every agent session of a run
    Restart {
        #[command(flatten)]
        selector: RunSelector,

        /// Print the actions without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Kill sessions and delete a run's workspaces
    Cleanup {
        #[command(flatten)]
        selector: RunSelector,

        /// Keep workspaces on disk
        #[arg(long)]
        keep_workspaces: bool,

        /// Print the actions without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Merge workspaces and close tickets of a completed run
    Close {
        #[command(flatten)]
        selector: RunSelector,

        /// Changelog entry recorded on each closed ticket
        #[arg(long)]
        changelog_entry: Option<String>,

        /// Print the commands without running them
        #[arg(long)]
        dry_run: bool,
    },

    /// Answer the oldest pending guidance request
    Guide {
        #[command(flatten)]
        selector: RunSelector,

        /// Answer written back to the agent
        #[arg(long)]
        answer: String,
    },

    /// Refresh and show a run's state
    Status(RunSelector),

    /// List stored runs
    Runs,

    /// Force-release a stale run lock
    Unlock {
        #[arg(long)]
        run_id: String,
    },

    /// Write the default policy to .metawsm/policy.toml
    PolicyInit,

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Ticket to work on (comma-separated or repeated)
    #[arg(long = "ticket", required = true, value_delimiter = ',')]
    pub tickets: Vec<String>,

    /// Repositories to include in each workspace (comma-separated or repeated)
    #[arg(long = "repos", value_delimiter = ',')]
    pub repos: Vec<String>,

    /// Workspace strategy (default from policy)
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Base branch for created workspaces (default from policy)
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Policy agent to start (repeatable; default all)
    #[arg(long = "agent")]
    pub agents: Vec<String>,

    /// Explicit run id
    #[arg(long)]
    pub run_id: Option<String>,

    /// Plan without executing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct BriefArgs {
    #[arg(long)]
    pub goal: Option<String>,

    #[arg(long)]
    pub scope: Option<String>,

    #[arg(long)]
    pub done_criteria: Option<String>,

    #[arg(long)]
    pub constraints: Option<String>,

    #[arg(long)]
    pub merge_intent: Option<String>,

    /// Fail instead of prompting for missing brief fields
    #[arg(long)]
    pub no_interactive: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunSelector {
    #[arg(long)]
    pub run_id: Option<String>,

    /// Select the newest run containing this ticket
    #[arg(long)]
    pub ticket: Option<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyArg {
    Create,
    Fork,
    Reuse,
}

impl From<StrategyArg> for WorkspaceStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Create => WorkspaceStrategy::Create,
            StrategyArg::Fork => WorkspaceStrategy::Fork,
            StrategyArg::Reuse => WorkspaceStrategy::Reuse,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
