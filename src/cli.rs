use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// The command line interface for the keypad link.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Connect to this port right away
    #[arg(short, long)]
    pub port: Option<String>,

    /// Talk to an in-memory device instead of real hardware
    #[arg(long)]
    pub mock: bool,

    /// Verbosity of the console output
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Also log to a daily rolling file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// Show the ports which can be connected to right now.
    ListPorts,

    /// Connect, then print the device's configuration as JSON.
    DumpConfigs,

    /// Connect, then write the configuration in the given JSON file to the device.
    SaveConfigs {
        /// A file as printed by `dump-configs`
        path: PathBuf,
    },

    /// Follow telemetry and state changes until interrupted. The default.
    Monitor,
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example telemetry response, as sent by the device.
    InfoResponse,

    /// Show an example configuration response, as sent by the device.
    ConfigsResponse,
}

/// Log levels selectable from the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
