//! CLI argument definitions for the Tally binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tally - index labeled bank transactions and ask questions about them.
#[derive(Parser, Debug)]
#[command(name = "tally", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the vector index, metadata and audit log.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Index one or more labeled transaction files (JSON arrays).
    Index {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the transactions most similar to a query.
    Search {
        query: String,
        /// Number of results.
        #[arg(short = 'k', long = "top-k")]
        k: Option<usize>,
    },
    /// Answer a question from the indexed transactions.
    Ask {
        question: String,
        /// Number of transactions used as context.
        #[arg(short = 'k', long = "top-k")]
        k: Option<usize>,
    },
    /// Show index and metadata sizes.
    Stats,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TALLY_CONFIG env var > ~/.tally/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TALLY_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Data directory override, if any.
    ///
    /// Priority: --data-dir flag > TALLY_DATA_DIR env var.
    pub fn resolve_data_dir(&self) -> Option<String> {
        if let Some(ref p) = self.data_dir {
            return Some(p.to_string_lossy().to_string());
        }
        std::env::var("TALLY_DATA_DIR").ok().filter(|s| !s.is_empty())
    }

    /// Log filter directive.
    ///
    /// Priority: --log-level flag > RUST_LOG env var > config file value.
    pub fn resolve_log_filter(&self, config_level: &str) -> String {
        if let Some(ref level) = self.log_level {
            return level.clone();
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.is_empty() {
                return filter;
            }
        }
        config_level.to_string()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".tally").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".tally").join("config.toml");
    }
    PathBuf::from("config.toml")
}
