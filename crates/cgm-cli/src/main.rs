//! Command-line interface for BLE continuous glucose monitoring sensors.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `serial` | Show the serial number of a sensor identity |
//! | `decode` | Decode a memory image dumped from the sensor tag |
//! | `packet` | Decode one streaming packet |
//! | `stream` | Connect to the saved sensor and print glucose values |
//! | `config` | Show the configuration |
//!
//! # Configuration
//!
//! Settings live in `~/.config/cgm/config.toml` (or platform equivalent):
//! the saved sensor and its calibration, glucose processing settings and
//! reconnection backoff. `cgm decode <dump> --save` fills in the sensor.
//!
//! # Environment Variables
//!
//! - `CGM_SENSOR_UID`, `CGM_SENSOR_PATCH_INFO`: sensor identity (overridden by flags)
//! - `CGM_CONFIG`: config file path
//! - `RUST_LOG`: log filter when neither `-v` nor `-q` is given

mod cli;
mod commands;
mod config;
mod format;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use commands::{DecodeArgs, StreamArgs, cmd_decode, cmd_packet, cmd_serial, cmd_stream};
use config::Config;
use util::write_output;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::path);
    let mut config = Config::load_from(&config_path);
    let output = cli.output.as_ref();

    match &cli.command {
        Commands::Serial { sensor } => cmd_serial(sensor, &config, output)?,
        Commands::Decode {
            file,
            sensor,
            format,
            save,
        } => cmd_decode(
            DecodeArgs {
                file,
                sensor,
                format: *format,
                save: *save,
                output,
                config_path: &config_path,
            },
            &mut config,
        )?,
        Commands::Packet {
            data,
            sensor,
            format,
        } => cmd_packet(data, sensor, *format, output, &config)?,
        Commands::Stream {
            interval,
            count,
            format,
        } => {
            cmd_stream(
                StreamArgs {
                    interval: *interval,
                    count: *count,
                    format: *format,
                    output,
                    quiet: cli.quiet,
                },
                &config,
            )
            .await?
        }
        Commands::Config { path } => {
            if *path {
                write_output(output, &format!("{}\n", config_path.display()))?;
            } else {
                let content = toml::to_string_pretty(&config)?;
                write_output(output, &content)?;
            }
        }
    }

    Ok(())
}
