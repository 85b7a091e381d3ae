//! Shell completion generation for the metawsm CLI.

use std::io;

use clap::CommandFactory;
use clap_complete::{Shell, generate};

use crate::cli::{Cli, CompletionShell};

fn shell_for(shell: CompletionShell) -> Shell {
    match shell {
        CompletionShell::Bash => Shell::Bash,
        CompletionShell::Zsh => Shell::Zsh,
        CompletionShell::Fish => Shell::Fish,
    }
}

pub fn print(shell: CompletionShell) {
    let mut cmd = Cli::command();
    generate(shell_for(shell), &mut cmd, "metawsm", &mut io::stdout());
}
