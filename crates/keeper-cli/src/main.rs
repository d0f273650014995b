//! Keeper CLI - manage the local inference runtime from a terminal.

use clap::{Parser, Subcommand};

mod commands;

/// Keeper - install, run and feed a local Ollama runtime
#[derive(Parser)]
#[command(name = "keeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Port of the runtime's HTTP API (overrides KEEPER_ENDPOINT)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe the runtime without starting anything
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show configuration and install paths
    Info,

    /// Install and start the runtime, keeping it up until Ctrl-C
    Up,

    /// Make sure a model is present, pulling it if needed
    Pull {
        /// Model name (default: configured model)
        model: Option<String>,
    },

    /// List models known to the runtime
    Models,

    /// Generate text for a prompt
    Generate {
        /// Prompt text
        prompt: String,
        /// Model name (default: configured model)
        #[arg(short, long)]
        model: Option<String>,
        /// Print an offline message instead of failing
        #[arg(long)]
        fallback: bool,
    },

    /// Stop leftover runtime processes started from our install
    StopOrphans {
        /// Kill without waiting for a graceful exit
        #[arg(long)]
        force: bool,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let config = commands::load_config(cli.port);

    match cli.command {
        Commands::Status { json } => commands::block_on(commands::status::run(&config, json)),
        Commands::Info => commands::info::run(&config),
        Commands::Up => commands::block_on(commands::up::run(config)),
        Commands::Pull { model } => commands::block_on(commands::pull::run(config, model)),
        Commands::Models => commands::block_on(commands::models::run(config)),
        Commands::Generate {
            prompt,
            model,
            fallback,
        } => commands::block_on(commands::generate::run(config, &prompt, model, fallback)),
        Commands::StopOrphans { force } => {
            commands::block_on(commands::stop_orphans::run(&config, force))
        }
    }
}
