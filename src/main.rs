// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod admin_client;
mod cli;
mod logging;
mod orchestrator;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let command = cli.command.unwrap_or(Commands::Serve);
    let exit_code = match command {
        Commands::Serve => {
            let config = gateway_config::load(cli.config.as_deref())?;
            orchestrator::run(config, cli.config.clone()).await?;
            0
        }
        Commands::ShowConfig => {
            let config = gateway_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            0
        }
        Commands::Health => admin_client::health(&cli.admin_url, cli.token.as_deref()).await,
        Commands::Status => admin_client::status(&cli.admin_url, cli.token.as_deref()).await,
        Commands::ResetSession { session_key } => {
            admin_client::reset_session(&cli.admin_url, cli.token.as_deref(), &session_key).await
        }
        Commands::ReloadConfig => admin_client::reload_config(&cli.admin_url, cli.token.as_deref()).await,
        Commands::Shutdown => admin_client::shutdown(&cli.admin_url, cli.token.as_deref()).await,
    };

    std::process::exit(exit_code);
}
