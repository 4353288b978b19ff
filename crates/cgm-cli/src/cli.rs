//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Reusable sensor identity arguments
#[derive(Debug, Clone, Default, Args)]
pub struct SensorArgs {
    /// Sensor uid (8 bytes hex, as read from the tag), or use CGM_SENSOR_UID
    #[arg(long, env = "CGM_SENSOR_UID")]
    pub uid: Option<String>,

    /// Sensor patch info (6 bytes hex), or use CGM_SENSOR_PATCH_INFO
    #[arg(long, env = "CGM_SENSOR_PATCH_INFO")]
    pub patch_info: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "cgm")]
#[command(author, version, about = "CLI for BLE continuous glucose monitoring sensors", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write output to file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    /// Use a different config file
    #[arg(long, global = true, env = "CGM_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the serial number and model encoded in a sensor identity
    Serial {
        #[command(flatten)]
        sensor: SensorArgs,
    },

    /// Decode a memory image dumped from the sensor tag
    Decode {
        /// Dump file (raw 344 bytes or hex text)
        file: PathBuf,

        #[command(flatten)]
        sensor: SensorArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Remember the sensor and its calibration in the config file
        #[arg(long)]
        save: bool,
    },

    /// Decode one encrypted 46-byte streaming packet
    Packet {
        /// Packet bytes as hex
        data: String,

        #[command(flatten)]
        sensor: SensorArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Connect to the configured sensor and print glucose values
    Stream {
        /// Minutes between values (overrides config)
        #[arg(short, long)]
        interval: Option<u32>,

        /// Stop after this many values (0 for no limit)
        #[arg(short = 'n', long, default_value = "0")]
        count: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the configuration
    Config {
        /// Print only the config file path
        #[arg(long)]
        path: bool,
    },
}
