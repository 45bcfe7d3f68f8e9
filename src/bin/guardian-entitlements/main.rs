//! guardian-entitlements CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, CliLogFormat, Command};
use guardian_entitlements::ServiceBuilder;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = cli.to_config()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        CliLogFormat::Text => registry.with(fmt::layer()).init(),
        CliLogFormat::Json => registry.with(fmt::layer().json()).init(),
    }

    info!("guardian-entitlements v{}", env!("CARGO_PKG_VERSION"));

    let command = cli.command.clone().unwrap_or(Command::Run);
    if let Command::CheckConfig = command {
        return print_json(&config);
    }

    let mut service = ServiceBuilder::new(config).build()?;
    let policy = Arc::clone(service.policy());

    match command {
        Command::Run | Command::CheckConfig => {
            service.run().await?;
            info!("Goodbye!");
        }
        Command::Info { wallet } => print_json(&policy.get_wallet_info(&wallet))?,
        Command::SetStatus { wallet, status } => {
            let record = policy.set_status(&wallet, status)?;
            print_json(&record)?;
        }
        Command::Reset { wallet } => {
            let existed = policy.reset_identity(&wallet)?;
            print_json(&serde_json::json!({ "wallet": wallet, "reset": existed }))?;
        }
        Command::TrialStatus { wallet } => print_json(&policy.trial_status(&wallet))?,
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
