use std::process;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use dockyard::cli::{build_provisioner, execute, load_cli_config, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    match run(&cli).await {
        Ok(output) => print!("{}", output),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<String> {
    let config = load_cli_config(cli.config.as_deref()).context("Failed to load config")?;
    debug!(
        "Using provisioner {} with state at {}",
        config.provisioner,
        config.state_path().display()
    );

    let provisioner = build_provisioner(&config).context("Failed to set up provisioner")?;

    // Deploy progress goes straight to stdout
    let mut events = tokio::io::stdout();
    let result = execute(provisioner.as_ref(), &cli.command, &mut events).await;
    events.flush().await?;
    Ok(result?)
}
