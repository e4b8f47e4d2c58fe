//! CLI argument definitions for the `lore` binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Lore: a character knowledge base with hybrid semantic search.
#[derive(Parser, Debug)]
#[command(name = "lore", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,

    /// Directory holding the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the tool API over HTTP (default).
    Serve,
    /// Create the database and schema, then print store statistics.
    InitDb,
    /// Recompute embeddings for stored characters and facts.
    Reembed {
        /// Only embed entities whose embedding is still pending.
        #[arg(long = "pending-only")]
        pending_only: bool,
    },
    /// Print the tool descriptors as JSON.
    Tools,
}

impl CliArgs {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > LORE_CONFIG env var > platform default (~/.lore/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("LORE_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the API server port.
    ///
    /// Priority: --port flag > LORE_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        resolve_port_from(self.port, std::env::var("LORE_PORT").ok(), config_port)
    }

    /// Resolve the data directory path.
    ///
    /// Priority: --data-dir flag > LORE_DATA_DIR env var.
    /// Returns `None` if neither is set (use config value).
    pub fn resolve_data_dir(&self) -> Option<String> {
        if let Some(ref p) = self.data_dir {
            return Some(p.to_string_lossy().to_string());
        }
        std::env::var("LORE_DATA_DIR").ok().filter(|v| !v.is_empty())
    }

    /// Resolve the log filter directive.
    ///
    /// Priority: --log-level flag > config file value > "info".
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        match self.log_level {
            Some(ref level) => level.clone(),
            None if !config_level.trim().is_empty() => config_level.to_string(),
            None => "info".to_string(),
        }
    }
}

fn resolve_port_from(flag: Option<u16>, env: Option<String>, config_port: u16) -> u16 {
    if let Some(p) = flag {
        return p;
    }
    if let Some(p) = env.and_then(|v| v.parse::<u16>().ok()) {
        return p;
    }
    config_port
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".lore").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".lore").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_serve() {
        let args = CliArgs::parse_from(["lore"]);
        assert_eq!(args.command(), Command::Serve);
    }

    #[test]
    fn test_subcommands_parse() {
        let args = CliArgs::parse_from(["lore", "reembed", "--pending-only"]);
        assert_eq!(args.command(), Command::Reembed { pending_only: true });

        let args = CliArgs::parse_from(["lore", "init-db"]);
        assert_eq!(args.command(), Command::InitDb);

        let args = CliArgs::parse_from(["lore", "tools"]);
        assert_eq!(args.command(), Command::Tools);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["lore", "serve", "--port", "9000", "-l", "debug"]);
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.resolve_log_level("warn"), "debug");
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let args = CliArgs::parse_from(["lore", "--config", "/tmp/lore.toml"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/lore.toml"));
    }

    #[test]
    fn test_port_priority() {
        assert_eq!(resolve_port_from(Some(1), Some("2".into()), 3), 1);
        assert_eq!(resolve_port_from(None, Some("2".into()), 3), 2);
        assert_eq!(resolve_port_from(None, Some("junk".into()), 3), 3);
        assert_eq!(resolve_port_from(None, None, 3), 3);
    }

    #[test]
    fn test_log_level_falls_back_to_config_then_info() {
        let args = CliArgs::parse_from(["lore"]);
        assert_eq!(args.resolve_log_level("warn"), "warn");
        assert_eq!(args.resolve_log_level(""), "info");
    }

    #[test]
    fn test_data_dir_flag() {
        let args = CliArgs::parse_from(["lore", "-d", "/srv/lore"]);
        assert_eq!(args.resolve_data_dir().as_deref(), Some("/srv/lore"));
    }
}
