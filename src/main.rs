mod cli;

use anyhow::Result;
use clap::Parser;
use waymark::commands;

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            commands::EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { scope, entry, opts } => {
            commands::run::run(&scope, &entry, &opts.into()).await
        }
        Command::Resume { workflow_id, opts } => {
            commands::resume::resume(&workflow_id, &opts.into()).await
        }
        Command::List => {
            commands::list::list(&mut std::io::stdout())?;
            Ok(commands::EXIT_COMPLETED)
        }
        Command::Demo { prompt, model } => {
            commands::demo::demo(&prompt, model, &mut std::io::stdout()).await?;
            Ok(commands::EXIT_COMPLETED)
        }
    }
}

/// Diagnostics go to stderr so they never interleave with reporter output.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
