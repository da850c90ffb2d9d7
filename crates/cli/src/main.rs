//! toolpilot CLI, the main entry point.
//!
//! Commands:
//! - `chat`      Interactive chat or single-message mode
//! - `tools`     List the tools the model would be offered
//! - `init`      Write a default config file
//! - `providers` List configured backends

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolpilot",
    about = "toolpilot: an autonomous tool-calling chat agent",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Model to use, optionally prefixed with a provider (`ollama:qwen3:8b`)
        #[arg(long)]
        model: Option<String>,

        /// Answer in a single pass instead of the autonomous loop
        #[arg(long)]
        standard: bool,

        /// Print the reply metadata as JSON after each answer
        #[arg(long)]
        json: bool,
    },

    /// List the tools offered to the model
    Tools,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// List configured providers
    Providers,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            message,
            model,
            standard,
            json,
        } => {
            commands::chat::run(commands::chat::ChatOptions {
                message,
                model,
                standard,
                json,
            })
            .await?
        }
        Commands::Tools => commands::tools::run().await?,
        Commands::Init { force } => commands::init::run(force)?,
        Commands::Providers => commands::providers::run()?,
    }

    Ok(())
}
