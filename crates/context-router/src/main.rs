//! # Context Router CLI (`ctxr`)
//!
//! ## Usage
//!
//! ```bash
//! ctxr --config ./config/ctxr.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxr init` | Create the SQLite database and schema |
//! | `ctxr ingest <path>` | Route, chunk, embed, and index a file tree |
//! | `ctxr query "<text>"` | Classify, retrieve, and rank once |
//! | `ctxr classify "<text>"` | Show which agent profile a query maps to |
//! | `ctxr profiles` | List the effective agent profiles |
//! | `ctxr model` | Show the active ranking model |
//! | `ctxr stats` | Chunk counts by content type |
//! | `ctxr serve` | Start the HTTP API and the adaptation worker |
//! | `ctxr completions <shell>` | Print shell completions |

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use context_router::config::{self, Config};
use context_router::{ingest, inspect, logging, migrate, query, server};

/// Context Router: agent-aware hybrid retrieval for AI coding assistants.
#[derive(Parser)]
#[command(
    name = "ctxr",
    about = "Context Router: agent-aware hybrid retrieval for AI coding assistants",
    version,
    long_about = "Context Router turns a query into ranked, context-sized results by combining \
    vector similarity and keyword search, shaping results to the calling agent's profile, and \
    adapting ranking weights from outcome feedback."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/ctxr.toml`. A missing file at the default
    /// path means built-in defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Index a file or directory tree.
    ///
    /// Each file is routed to a chunking strategy by declared type,
    /// extension, or content, then embedded (when a provider is configured)
    /// and stored. Unchanged files are skipped.
    Ingest {
        /// File or directory to index.
        path: PathBuf,

        /// Re-index every file, even if unchanged.
        #[arg(long)]
        full: bool,
    },

    /// Run a query through the full pipeline.
    Query {
        /// The query text.
        text: String,

        /// Agent profile hint (e.g. `code-review`). Overrides classification.
        #[arg(long)]
        agent: Option<String>,

        /// Show per-modality scores and feature activations.
        #[arg(long)]
        explain: bool,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show which agent profile a query is classified as.
    Classify {
        text: String,

        #[arg(long)]
        agent: Option<String>,
    },

    /// List the effective agent profiles.
    Profiles {
        #[arg(long)]
        json: bool,
    },

    /// Show the active ranking model version and weights.
    Model {
        #[arg(long)]
        json: bool,
    },

    /// Show chunk counts by content type.
    Stats,

    /// Start the HTTP API and the feedback adaptation worker.
    Serve {
        /// Index this path before serving (useful with the memory backend).
        #[arg(long)]
        ingest: Option<PathBuf>,
    },

    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

const DEFAULT_CONFIG: &str = "./config/ctxr.toml";

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path == Path::new(DEFAULT_CONFIG) {
        return Ok(Config::default());
    }
    config::load_config(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "ctxr", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = load(&cli.config)?;
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, full } => {
            ingest::run_ingest(&cfg, &path, full).await?;
        }
        Commands::Query {
            text,
            agent,
            explain,
            json,
        } => {
            query::run_query(&cfg, &text, agent, explain, json).await?;
        }
        Commands::Classify { text, agent } => {
            query::run_classify(&cfg, &text, agent.as_deref()).await?;
        }
        Commands::Profiles { json } => {
            inspect::run_profiles(&cfg, json).await?;
        }
        Commands::Model { json } => {
            inspect::run_model(&cfg, json).await?;
        }
        Commands::Stats => {
            inspect::run_stats(&cfg).await?;
        }
        Commands::Serve { ingest } => {
            server::run_server(&cfg, ingest.as_deref()).await?;
        }
        // Handled before the config is loaded.
        Commands::Completions { .. } => {}
    }

    Ok(())
}
