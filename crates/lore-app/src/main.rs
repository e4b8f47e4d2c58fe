//! Lore: character knowledge base with hybrid semantic search.
//!
//! Loads configuration, opens the SQLite store, builds the model provider
//! and either serves the tool API or runs a one-shot maintenance command.

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{CliArgs, Command};
use lore_api::{descriptors, AppState};
use lore_core::config::LoreConfig;
use lore_core::deadline::Deadline;
use lore_storage::{Database, KnowledgeStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let config_file = args.resolve_config_path();
    let mut config = LoreConfig::load_or_default(&config_file);
    if let Some(dir) = args.resolve_data_dir() {
        config.general.data_dir = dir;
    }
    config.general.port = args.resolve_port(config.general.port);
    let log_level = args.resolve_log_level(&config.general.log_level);
    config.general.log_level = log_level.clone();

    // RUST_LOG wins over every other source.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    tracing::info!("Starting Lore v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(path = %config_file.display(), "Configuration loaded");
    config.validate()?;

    let command = args.command();
    if command == Command::Tools {
        println!("{}", serde_json::to_string_pretty(&descriptors())?);
        return Ok(());
    }

    let store = open_store(&config).await?;

    match command {
        Command::InitDb => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Reembed { pending_only } => {
            let state = build_state(config, store)?;
            let pipeline = state.tools.pipeline();
            let report = if pending_only {
                pipeline.backfill(usize::MAX, Deadline::none()).await?
            } else {
                pipeline.reembed_all(Deadline::none()).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Serve => {
            let state = build_state(config, store)?;
            lore_api::start_server(state).await?;
        }
        Command::Tools => {}
    }

    Ok(())
}

async fn open_store(config: &LoreConfig) -> Result<KnowledgeStore, Box<dyn std::error::Error>> {
    let data_dir = expand_home(&config.general.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    let db_path = data_dir.join(&config.storage.database_file);
    let db = Database::open(&db_path, &config.storage)?;
    tracing::info!(path = %db_path.display(), "SQLite database opened");

    let store =
        KnowledgeStore::open(Arc::new(db), config.embedding.dimension, &config.storage).await?;
    Ok(store)
}

fn build_state(
    config: LoreConfig,
    store: KnowledgeStore,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let provider = lore_vector::from_config(&config.provider, config.embedding.dimension)?;
    tracing::info!(
        kind = %config.provider.kind,
        embedding_model = %config.provider.embedding_model,
        dimension = config.embedding.dimension,
        "Model provider ready"
    );
    Ok(AppState::new(config, store, provider)?)
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(dir: &str) -> PathBuf {
    let rest = dir.strip_prefix("~/").or_else(|| dir.strip_prefix("~\\"));
    match rest {
        Some(rest) => {
            #[cfg(target_os = "windows")]
            let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
            #[cfg(not(target_os = "windows"))]
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(rest)
        }
        None => PathBuf::from(dir),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("./data"), PathBuf::from("./data"));
        assert_eq!(expand_home("/var/lib/lore"), PathBuf::from("/var/lib/lore"));
    }

    #[test]
    fn test_expand_home_joins_home() {
        let expanded = expand_home("~/lore-data");
        assert!(expanded.ends_with("lore-data"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
