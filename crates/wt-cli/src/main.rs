mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use wt_core::cache::ProjectCache;
use wt_core::config::{Config, LogFormat};
use wt_telemetry::logging::{init_logging, LogStyle};

/// wt -- inspect and edit translation projects, their stability and backups.
#[derive(Parser)]
#[command(name = "wt", version, about)]
struct Cli {
    /// Config file to use instead of ~/.config/wt/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the projects in the store.
    List,

    /// Create an empty project and write it to the store.
    Create {
        /// Project id (letters, digits, '-', '_' and '.').
        id: String,
        /// Project type, e.g. newgrf or game-script.
        #[arg(long = "type")]
        project_type: String,
        /// Code of the base language, e.g. en_GB.
        #[arg(long)]
        base_language: String,
        /// Human readable name (defaults to the id).
        #[arg(long)]
        name: Option<String>,
        /// Project homepage.
        #[arg(long)]
        url: Option<String>,
    },

    /// Show stability per language, or the strings of one language.
    Show {
        id: String,
        /// Only show this language.
        #[arg(short, long)]
        language: Option<String>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Record a new translation for one string.
    Edit {
        id: String,
        language: String,
        key: String,
        text: String,
        /// Who made the change.
        #[arg(short, long)]
        author: String,
        /// Case variant as NAME=TEXT; may be repeated.
        #[arg(long = "case", value_parser = commands::edit::parse_case)]
        cases: Vec<(String, String)>,
    },

    /// Print one language as JSON, stable strings only by default.
    Export {
        id: String,
        language: String,
        /// Include strings that are not stable yet.
        #[arg(long)]
        unstable: bool,
    },

    /// Show the backup files kept for a project.
    Backups { id: String },

    /// Load, validate and print the effective configuration.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    let style = match config.general.log_format {
        LogFormat::Pretty => LogStyle::Pretty,
        LogFormat::Json => LogStyle::Json,
    };
    init_logging("wt", &config.general.log_level, style);

    if let Commands::CheckConfig = cli.command {
        return commands::check_config::run(&config, cli.config.as_deref());
    }

    let cache = ProjectCache::from_config(&config);
    let result = match cli.command {
        Commands::List => commands::list::run(cache.store()),
        Commands::Create {
            id,
            project_type,
            base_language,
            name,
            url,
        } => {
            commands::create::run(
                &cache,
                &config.projects,
                &id,
                &project_type,
                &base_language,
                name,
                url,
            )
            .await
        }
        Commands::Show { id, language, json } => {
            commands::show::run(&cache, &id, language.as_deref(), json).await
        }
        Commands::Edit {
            id,
            language,
            key,
            text,
            author,
            cases,
        } => commands::edit::run(&cache, &id, &language, &key, text, &author, cases).await,
        Commands::Export {
            id,
            language,
            unstable,
        } => commands::export::run(&cache, &id, &language, unstable).await,
        Commands::Backups { id } => commands::backups::run(cache.store(), &id),
        Commands::CheckConfig => Ok(()),
    };

    // Whatever happened above, nothing dirty is left behind.
    let flushed = cache.flush_all().await.context("flushing projects");
    result?;
    flushed?;
    Ok(())
}
