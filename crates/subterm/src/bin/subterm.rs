use clap::Parser;
use std::io::{self, Write};
use subterm::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    subterm::logging::init(cli.log_level);

    let code = subterm::dispatch(cli.command).await?;

    // Exit directly: the stdin forwarder of `run` may still be parked in read(2)
    let _ = io::stderr().flush();
    let _ = io::stdout().flush();
    std::process::exit(code)
}
