mod cli;
mod config;
mod db;
mod embedding;
mod llm;
mod memory;
mod nli;
mod server;
mod tools;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mnemon", version, about = "Persistent fragment memory MCP server for AI agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio by default, HTTP with --http)
    Serve {
        /// Serve over streamable HTTP instead of stdio
        #[arg(long)]
        http: bool,
    },
    /// Manage the local NLI model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Run the consolidation pipeline once and print the report
    Consolidate,
    /// Print memory store statistics
    Stats,
    /// Run database diagnostics and print a health report
    Doctor,
    /// Delete the database file (asks for confirmation)
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the NLI model and tokenizer to ~/.mnemon/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (for log level)
    let config = config::MnemonConfig::load()?;

    // Initialize tracing with the configured log level.
    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { http } => {
            if http || config.server.transport == "http" {
                server::serve_http(config).await?;
            } else {
                server::serve_stdio(config).await?;
            }
        }
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.nli).await?;
            }
        },
        Command::Consolidate => {
            cli::consolidate(&config)?;
        }
        Command::Stats => {
            cli::stats(&config)?;
        }
        Command::Doctor => {
            cli::doctor(&config)?;
        }
        Command::Reset { yes } => {
            cli::reset(&config, yes)?;
        }
    }

    Ok(())
}
