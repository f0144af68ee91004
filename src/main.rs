mod agent;
mod autofix;
mod cli;
mod config;
mod deploy;
mod error;
mod executor;
mod registry;
mod resources;
mod ssh;
mod supervisor;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.default_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    cli.execute().await?;
    Ok(())
}
