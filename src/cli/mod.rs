pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::AgentConfig;
use crate::error::Result;

#[derive(Parser)]
#[command(name = "fleet-agent")]
#[command(version)]
#[command(about = "Fleet operations agent for a small set of hosts")]
#[command(long_about = "Run commands, deploy files and repair services across local and SSH-reachable hosts over an authenticated HTTP API.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the agent configuration file
    #[arg(short, long, global = true, env = "FLEET_AGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP agent
    Serve {
        /// Bind address (overrides `listen` from the config)
        #[arg(long)]
        bind: Option<String>,

        /// Listen port (overrides the port from `listen`)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show the configured host inventory
    Hosts,

    /// Run the pre-deploy resource check against one host
    Resources {
        /// Host key (e.g., vm1)
        host: String,
    },
}

impl Cli {
    /// Default log filter for this invocation; `RUST_LOG` takes precedence.
    pub fn default_filter(&self) -> &'static str {
        if self.verbose {
            "fleet_agent=debug,tower_http=debug"
        } else {
            "fleet_agent=info,tower_http=info"
        }
    }

    pub async fn execute(self) -> Result<()> {
        let config = AgentConfig::load(self.config.as_deref())?;

        match self.command {
            Commands::Serve { bind, port } => commands::serve::execute(&config, bind, port).await,
            Commands::Hosts => commands::hosts::execute(&config),
            Commands::Resources { host } => commands::resources::execute(&config, &host).await,
        }
    }
}
