//! # Brief Forge CLI (`brief-forge`)
//!
//! The `brief-forge` binary initializes the database and runs the API
//! server.
//!
//! ## Usage
//!
//! ```bash
//! brief-forge --config ./config/brief-forge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `brief-forge init` | Create the SQLite database and run schema migrations |
//! | `brief-forge serve` | Start the HTTP API server |
//!
//! Secrets are passed through the environment: `BRIEF_FORGE_SECRET_KEY`,
//! `ANTHROPIC_API_KEY`, `PINECONE_API_KEY`, `OPENAI_API_KEY` or
//! `COHERE_API_KEY`, and `FASTMOSS_CLIENT_ID`/`FASTMOSS_CLIENT_SECRET`.

mod ai;
mod auth;
mod brief;
mod config;
mod copilot;
mod db;
mod embedding;
mod fastmoss;
mod knowledge;
mod market;
mod migrate;
mod models;
mod projects;
mod server;
mod shops;
mod vector;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Brief Forge — a multi-tenant backend for AI-generated short-form video
/// creative briefs.
#[derive(Parser)]
#[command(
    name = "brief-forge",
    about = "Brief Forge — AI creative briefs and market intelligence for e-commerce sellers",
    version,
    long_about = "Brief Forge serves a multi-tenant API: JWT auth, shop and project management, \
    LLM-generated creative briefs, a two-layer knowledge base with vector retrieval, a streaming \
    RAG copilot, and market analytics proxied from an external provider."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/brief-forge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Start the HTTP API server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// API under `/api/v1`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
