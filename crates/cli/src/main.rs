use anyhow::Result;
use clap::Parser;

use batchgate_cli::{Cli, Commands};
use batchgate_observability::LogConfig;

fn main() -> Result<()> {
    // stdout carries the command output
    batchgate_observability::init_with(
        &LogConfig::from_env()
            .with_default_filter("warn")
            .with_stderr(true),
    );

    let cli = Cli::parse();
    let output = match cli.command {
        Commands::Simulate(args) => batchgate_cli::commands::simulate::execute(&args, cli.format)?,
        Commands::Enqueue(args) => batchgate_cli::commands::enqueue::execute(&args, cli.format)?,
    };
    print!("{output}");
    Ok(())
}
