//! Kestrel CLI, the main entry point.
//!
//! Commands:
//! - `chat`: interactive or single-message agent session
//! - `tools`: discover and list the tools the model would see
//! - `mcp`: connect to configured MCP servers and report their status
//! - `doctor`: diagnose configuration and environment

use clap::{Parser, Subcommand};

mod approver;
mod commands;

#[derive(Parser)]
#[command(
    name = "kestrel",
    about = "Kestrel: an agentic CLI that lets a language model drive local tools",
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

        /// Approve every tool call without asking
        #[arg(long)]
        yolo: bool,
    },

    /// Discover tools and list their declarations
    Tools {
        /// Print the full declarations as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show MCP server status
    Mcp,

    /// Diagnose configuration and environment
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with model output
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat { message, yolo } => commands::chat::run(message, yolo).await?,
        Commands::Tools { json } => commands::tools::run(json).await?,
        Commands::Mcp => commands::mcp::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
