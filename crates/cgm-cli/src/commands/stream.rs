//! Stream command implementation.
//!
//! Keeps a BLE connection to the saved sensor and prints every glucose value
//! the pipeline emits. Reconnection is handled by the driver; this command
//! only renders events until Ctrl+C or the requested count.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use cgm_core::connection::{BleDriver, ConnectionOptions, DriverConfig, get_adapter};
use cgm_core::persistence::FilePersistence;
use cgm_core::pipeline::{GlucosePipeline, GlucoseService};
use cgm_core::{DomainEvent, EventDispatcher};
use cgm_types::Sensor;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::packet::saved_calibration;
use crate::cli::OutputFormat;
use crate::config::Config;
use crate::format::{format_glucose_json_line, format_glucose_line, format_status_event};

/// Arguments for the stream command.
pub struct StreamArgs<'a> {
    pub interval: Option<u32>,
    pub count: usize,
    pub format: OutputFormat,
    pub output: Option<&'a PathBuf>,
    pub quiet: bool,
}

pub async fn cmd_stream(args: StreamArgs<'_>, config: &Config) -> Result<()> {
    let identity = config
        .sensor_identity()?
        .ok_or_else(|| anyhow!("No saved sensor. Run 'cgm decode <dump> --save' first."))?;
    let calibration = saved_calibration(config, &identity)?;
    let sensor = Sensor::new(identity, calibration, OffsetDateTime::now_utc());

    let settings = config.pipeline_settings(args.interval)?;
    let options = ConnectionOptions {
        reconnect: config.reconnect_options()?,
        interval_guard: settings.interval_guard,
        ..Default::default()
    };
    let interval = settings.sampling_interval_minutes;

    let mut out: Box<dyn Write> = match args.output {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };

    let events = EventDispatcher::default();
    let mut rx = events.subscribe();
    let service = GlucoseService::spawn(
        GlucosePipeline::for_sensor(&sensor, settings)?,
        events.clone(),
    );

    let adapter = get_adapter()
        .await
        .context("No Bluetooth adapter available")?;
    let persistence = Arc::new(FilePersistence::open(config.persistence_path()));
    let (handle, task) = BleDriver::spawn(
        adapter,
        persistence,
        events.clone(),
        options,
        DriverConfig::default(),
    )?;

    if !args.quiet {
        eprintln!(
            "Streaming from {} every {} min | Press Ctrl+C to stop",
            sensor.serial(),
            interval
        );
    }
    handle.connect(sensor, interval).await?;

    let mut printed = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                break;
            }
            event = rx.recv() => match event {
                Ok(DomainEvent::GlucoseValuesAdded { values }) => {
                    for value in &values {
                        let line = match args.format {
                            OutputFormat::Text => format_glucose_line(value),
                            OutputFormat::Json => format_glucose_json_line(value)?,
                        };
                        out.write_all(line.as_bytes())?;
                        printed += 1;
                    }
                    out.flush()?;
                    if args.count > 0 && printed >= args.count {
                        info!("Received {} values", printed);
                        break;
                    }
                }
                Ok(event) if !args.quiet => {
                    if let Some(status) = format_status_event(&event) {
                        eprintln!("{}", status);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.shutdown();
    if let Err(e) = task.await {
        warn!("Connection task ended abnormally: {}", e);
    }
    service.shutdown().await?;
    Ok(())
}
