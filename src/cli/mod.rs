use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::{default_config_path, Settings};
use crate::constants::DB_DIR_NAME;
use crate::document::{DocType, FilterClause};
use crate::embed::ModelType;
use crate::logger::LogLevel;

mod commands;

/// Hybrid lexical + semantic search over study questions and materials
#[derive(Parser, Debug)]
#[command(name = "studysearch")]
#[command(author, version = env!("CARGO_PKG_VERSION_FULL"), about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Database directory (defaults to ./.studysearch.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// YAML config file (defaults to <db>/config.yaml, then ~/.studysearch/config.yaml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Embedding model, overrides the config file
    #[arg(long, global = true, value_enum)]
    pub model: Option<ModelType>,

    /// Set log level
    #[arg(short = 'l', long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub loglevel: LogLevel,

    /// Suppress informational output (only show results/errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest documents from a JSON array or JSON-lines file ("-" for stdin)
    ///
    /// Each entry is {"text": ..., "metadata": {...}, "doc_id": ...};
    /// metadata and doc_id are optional.
    Ingest {
        file: PathBuf,
    },

    /// Hybrid search
    Query {
        /// Query text (e.g., "derivative rules")
        text: String,

        /// Number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Vector weight in [0, 1] (0 = keyword only, 1 = semantic only)
        #[arg(short, long)]
        alpha: Option<f32>,

        /// Metadata filter, repeatable: field=value, field!=value, field>=2, field=a|b
        #[arg(short, long = "filter")]
        filters: Vec<FilterClause>,

        /// Only questions or only materials
        #[arg(short = 't', long = "type", value_enum)]
        doc_type: Option<DocType>,

        /// Show per-store score breakdown
        #[arg(long)]
        scores: bool,
    },

    /// Show a stored document
    Get {
        doc_id: String,
    },

    /// Delete documents from both stores
    #[command(visible_alias = "rm")]
    Delete {
        #[arg(required = true)]
        doc_ids: Vec<String>,
    },

    /// Show index statistics
    Stats,

    /// Re-embed every document with the configured model
    Reindex,
}

/// Options shared by every command
pub(crate) struct Context {
    pub db_path: PathBuf,
    pub settings: Settings,
    pub json: bool,
    pub cancel_token: CancellationToken,
}

pub async fn run(cli: Cli, cancel_token: CancellationToken) -> Result<()> {
    if cli.quiet || cli.json {
        crate::output::set_quiet(true);
    }

    let db_path = match cli.db {
        Some(path) => path,
        None => std::env::current_dir()?.join(DB_DIR_NAME),
    };

    match crate::logger::init_logger(&db_path, cli.loglevel, cli.quiet || cli.json) {
        Ok((_, rotation)) => {
            if let Err(e) = crate::logger::cleanup_old_logs(&db_path, &rotation) {
                tracing::warn!("Log cleanup failed: {}", e);
            }
        }
        Err(e) => crate::warn_print!("Warning: Failed to initialize file logger: {}", e),
    }

    let config_path = cli.config.or_else(|| default_config_path(&db_path));
    let mut settings = Settings::load(config_path.as_deref())?;
    if let Some(model) = cli.model {
        settings.embedding.model = model;
    }
    settings.validate()?;

    tracing::info!(
        "Starting studysearch v{} (db: {})",
        env!("CARGO_PKG_VERSION_FULL"),
        db_path.display()
    );

    let ctx = Context {
        db_path,
        settings,
        json: cli.json,
        cancel_token,
    };

    match cli.command {
        Commands::Ingest { file } => commands::ingest(&ctx, &file).await,
        Commands::Query {
            text,
            top_k,
            alpha,
            filters,
            doc_type,
            scores,
        } => {
            let options = commands::QueryOptions {
                top_k,
                alpha,
                filters,
                doc_type,
                show_scores: scores,
            };
            commands::query(&ctx, &text, options).await
        }
        Commands::Get { doc_id } => commands::get(&ctx, &doc_id).await,
        Commands::Delete { doc_ids } => commands::delete(&ctx, doc_ids).await,
        Commands::Stats => commands::stats(&ctx).await,
        Commands::Reindex => commands::reindex(&ctx).await,
    }
}
