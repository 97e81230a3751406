//! Command-line front end for PTY sessions

pub mod cli;
pub mod exec;
pub mod logging;
pub mod run;
pub mod terminal_guard;

use anyhow::Result;
use cli::Command;

/// Run the selected subcommand and return the exit code to leave with
pub async fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => run::run(args).await,
        Command::Exec(args) => exec::exec(args).await,
    }
}
