use clap::{Parser, Subcommand};
use reservoir::models::Dataset;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "reservoir", version, about = "Log, span and trace storage")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "reservoir.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Probe the storage backend and show its capabilities
    Health,

    /// Create or upgrade the schema to the latest version
    Init,

    /// Apply schema migrations up to a version
    Migrate {
        /// Target schema version (latest when omitted)
        #[arg(long)]
        to: Option<u32>,
    },

    /// Delete expired data for a set of projects
    Retention(RetentionArgs),

    /// List backend segments (chunks or partitions)
    Segments {
        #[arg(short, long, default_value = "logs")]
        dataset: Dataset,

        /// How many days back to list
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct RetentionArgs {
    /// Project ids to sweep
    #[arg(short, long = "project", required = true)]
    pub projects: Vec<String>,

    /// Keep this many days of data
    #[arg(long)]
    pub days: u32,

    /// Drop whole segments older than this many days, for every project
    #[arg(long)]
    pub global_days: Option<u32>,

    /// Dataset to sweep (both when omitted)
    #[arg(short, long)]
    pub dataset: Option<Dataset>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Display current configuration (with secrets masked)
    Show,

    /// Validate configuration file
    Validate,
}
