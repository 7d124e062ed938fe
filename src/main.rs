mod auth;
mod cli;
mod config;
mod error;
mod output;
mod pipeline;
mod recipe;
mod report;
mod trigger;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting zebrad-release");
    cli.execute().await?;

    Ok(())
}
