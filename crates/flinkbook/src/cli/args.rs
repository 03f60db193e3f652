use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Run Flink SQL against a local MiniCluster or a remote SQL Gateway.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, env = "FLINKBOOK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(long)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Start the local runtime and keep it running until Ctrl+C
    Serve,
    /// Run one SQL statement and print its results
    Query {
        /// The statement to run
        sql: String,
        /// Use an already running SQL Gateway instead of the local runtime
        #[arg(long, env = "FLINKBOOK_GATEWAY_URL")]
        gateway_url: Option<String>,
        /// Statement key; a running statement with the same key is canceled
        #[arg(long)]
        key: Option<String>,
        /// What to do when a streaming statement reaches the row cap
        #[arg(long, value_enum, default_value_t = LimitAction::Prompt)]
        on_limit: LimitAction,
    },
    /// Inspect or create the settings file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Clone, Copy)]
pub enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Print the settings file path
    Path,
    /// Write the default settings if no file exists yet
    Init,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitAction {
    /// Ask on the terminal
    Prompt,
    /// Keep consuming rows
    Continue,
    /// Cancel the statement
    Stop,
}
