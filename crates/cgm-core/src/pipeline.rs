//! Turning raw readings into displayable glucose values.
//!
//! A batch of [`SensorReading`]s goes through four steps:
//!
//! 1. readings without quality flags are calibrated (factory, then custom)
//!    and smoothed;
//! 2. the batch is suppressed when the last five calibrated values, carried
//!    over from earlier batches, spread too widely to be physiological;
//! 3. values closer than the sampling interval to the previously emitted
//!    value are dropped;
//! 4. the remaining values are clamped, rounded and annotated with the
//!    slope against the previously emitted value.
//!
//! Readings not newer than the newest reading already processed are ignored,
//! so a batch delivered twice leaves the pipeline unchanged.
//!
//! [`GlucosePipeline`] holds all cross-batch state. [`GlucoseService`] gives
//! it a single owner task fed from the event bus.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use cgm_types::{CustomCalibrationPoint, Sensor, SensorGlucose, SensorReading};

use crate::calibration::{
    DEFAULT_FILTER_NOISE, KalmanFilter, LinearFit, ReadableRange, check_quality,
    factory_calibrate, slope, trend,
};
use crate::connection::machine::DEFAULT_INTERVAL_GUARD;
use crate::error::{Error, Result};
use crate::events::{ConnectionError, DomainEvent, EventDispatcher};

/// Number of most recent calibrated values checked for outliers.
pub const OUTLIER_WINDOW: usize = 5;

/// Standard deviation, in mg/dL, at which a batch is suppressed.
pub const OUTLIER_STDEV: f64 = 100.0;

/// Tunables of the glucose pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Minutes between emitted values.
    pub sampling_interval_minutes: u32,
    /// Slack subtracted from the sampling interval.
    pub interval_guard: Duration,
    /// Displayable range values are clamped to.
    pub readable_range: ReadableRange,
    /// User reference points for custom calibration.
    pub custom_calibration: Vec<CustomCalibrationPoint>,
    /// Whether emitted values are smoothed.
    pub smoothing: bool,
    /// Process and observation noise of the smoothing filter.
    pub filter_noise: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            sampling_interval_minutes: 1,
            interval_guard: DEFAULT_INTERVAL_GUARD,
            readable_range: ReadableRange::STANDARD,
            custom_calibration: Vec::new(),
            smoothing: true,
            filter_noise: DEFAULT_FILTER_NOISE,
        }
    }
}

impl PipelineSettings {
    /// Set the sampling interval in minutes.
    #[must_use]
    pub fn sampling_interval(mut self, minutes: u32) -> Self {
        self.sampling_interval_minutes = minutes;
        self
    }

    /// Enable or disable smoothing.
    #[must_use]
    pub fn smoothing(mut self, enabled: bool) -> Self {
        self.smoothing = enabled;
        self
    }

    /// Set the custom calibration points.
    #[must_use]
    pub fn custom_calibration(mut self, points: Vec<CustomCalibrationPoint>) -> Self {
        self.custom_calibration = points;
        self
    }

    /// Validate the settings and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_interval_minutes == 0 {
            return Err(Error::invalid_config("sampling_interval_minutes must be > 0"));
        }
        if !self.filter_noise.is_finite() || self.filter_noise <= 0.0 {
            return Err(Error::invalid_config("filter_noise must be a positive number"));
        }
        self.readable_range.validate()?;
        if self.readable_range.min < 0.0 || self.readable_range.max > f64::from(u16::MAX) {
            return Err(Error::invalid_config(format!(
                "readable range must lie within 0..{}",
                u16::MAX
            )));
        }
        Ok(())
    }

    /// Minimum spacing between two emitted values.
    #[must_use]
    pub fn min_spacing(&self) -> Duration {
        Duration::from_secs(u64::from(self.sampling_interval_minutes) * 60)
            .saturating_sub(self.interval_guard)
    }
}

/// Result of one [`GlucosePipeline::ingest`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Values to publish, oldest first. May be empty.
    Emitted(Vec<SensorGlucose>),
    /// The batch looked implausible and nothing was emitted.
    Suppressed {
        /// Spread of the checked values.
        stdev: f64,
    },
}

impl IngestOutcome {
    /// Emitted values, empty when suppressed.
    #[must_use]
    pub fn values(&self) -> &[SensorGlucose] {
        match self {
            IngestOutcome::Emitted(values) => values,
            IngestOutcome::Suppressed { .. } => &[],
        }
    }
}

/// Population standard deviation of the last [`OUTLIER_WINDOW`] values,
/// if it reaches [`OUTLIER_STDEV`].
#[must_use]
pub fn outlier_spread(values: &[f64]) -> Option<f64> {
    let window = &values[values.len().saturating_sub(OUTLIER_WINDOW)..];
    if window.len() < 2 {
        return None;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stdev = variance.sqrt();
    (stdev >= OUTLIER_STDEV).then_some(stdev)
}

#[derive(Debug, Clone)]
struct Calibrated {
    reading: SensorReading,
    factory: f64,
    value: f64,
}

/// Sequence-level glucose processing for one sensor.
#[derive(Debug, Clone)]
pub struct GlucosePipeline {
    settings: PipelineSettings,
    fit: LinearFit,
    sensor: Option<Sensor>,
    filter: KalmanFilter,
    recent: VecDeque<f64>,
    last_seen: Option<OffsetDateTime>,
    last_emitted: Option<SensorGlucose>,
}

impl GlucosePipeline {
    /// Create a pipeline with no sensor yet.
    pub fn new(settings: PipelineSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            fit: LinearFit::fit(&settings.custom_calibration),
            filter: KalmanFilter::new(settings.filter_noise),
            settings,
            sensor: None,
            recent: VecDeque::with_capacity(OUTLIER_WINDOW),
            last_seen: None,
            last_emitted: None,
        })
    }

    /// Create a pipeline for `sensor`.
    pub fn for_sensor(sensor: &Sensor, settings: PipelineSettings) -> Result<Self> {
        let mut pipeline = Self::new(settings)?;
        pipeline.set_sensor(sensor);
        Ok(pipeline)
    }

    /// Current settings.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Sensor whose readings are processed.
    pub fn sensor(&self) -> Option<&Sensor> {
        self.sensor.as_ref()
    }

    /// Last value emitted.
    pub fn last_emitted(&self) -> Option<&SensorGlucose> {
        self.last_emitted.as_ref()
    }

    /// Switch to another sensor. A different sensor starts a new stream.
    pub fn set_sensor(&mut self, sensor: &Sensor) {
        let same = self
            .sensor
            .as_ref()
            .is_some_and(|current| current.identity == sensor.identity);
        if !same {
            info!("Glucose pipeline now follows sensor {}", sensor.serial());
            self.reset_stream();
        }
        self.sensor = Some(sensor.clone());
    }

    /// Replace the settings.
    ///
    /// The smoothing filter restarts when its noise changes.
    pub fn update_settings(&mut self, settings: PipelineSettings) -> Result<()> {
        settings.validate()?;
        self.fit = LinearFit::fit(&settings.custom_calibration);
        if settings.filter_noise != self.settings.filter_noise {
            self.filter = KalmanFilter::new(settings.filter_noise);
        }
        self.settings = settings;
        Ok(())
    }

    /// Forget the smoothing state, the outlier window and the emitted values.
    pub fn reset_stream(&mut self) {
        self.filter.reset();
        self.recent.clear();
        self.last_seen = None;
        self.last_emitted = None;
    }

    /// Process one batch of readings.
    pub fn ingest(&mut self, readings: &[SensorReading]) -> IngestOutcome {
        let Some(sensor) = self.sensor.as_ref() else {
            debug!("No sensor, ignoring {} readings", readings.len());
            return IngestOutcome::Emitted(Vec::new());
        };

        let mut sorted: Vec<&SensorReading> = readings
            .iter()
            .filter(|r| self.last_seen.is_none_or(|seen| r.timestamp > seen))
            .collect();
        sorted.sort_by_key(|r| r.timestamp);
        let Some(newest) = sorted.last().map(|r| r.timestamp) else {
            debug!("No new readings in batch of {}", readings.len());
            return IngestOutcome::Emitted(Vec::new());
        };

        // Smoothing runs on a copy that is kept only if the batch is accepted.
        let mut filter = self.filter;
        let mut calibrated = Vec::with_capacity(sorted.len());
        for reading in sorted {
            if let Err(e) = check_quality(reading) {
                debug!("Skipping reading at {}: {}", reading.timestamp, e);
                continue;
            }
            let Some(factory) =
                factory_calibrate(reading, &sensor.factory_calibration, sensor.family)
            else {
                debug!("Reading at {} cannot be calibrated", reading.timestamp);
                continue;
            };
            let value = self.settings.readable_range.clamp(self.fit.apply(factory));
            let value = if self.settings.smoothing {
                filter.update(value)
            } else {
                value
            };
            calibrated.push(Calibrated {
                reading: reading.clone(),
                factory,
                value,
            });
        }

        self.last_seen = Some(newest);
        if calibrated.is_empty() {
            return IngestOutcome::Emitted(Vec::new());
        }
        let window: Vec<f64> = self
            .recent
            .iter()
            .copied()
            .chain(calibrated.iter().map(|c| c.value))
            .collect();
        self.recent = window[window.len().saturating_sub(OUTLIER_WINDOW)..]
            .iter()
            .copied()
            .collect();
        if let Some(stdev) = outlier_spread(&window) {
            warn!(
                "Suppressing {} implausible values (stdev {:.1})",
                calibrated.len(),
                stdev
            );
            return IngestOutcome::Suppressed { stdev };
        }
        self.filter = filter;

        let spacing = self.settings.min_spacing();
        let mut emitted = Vec::new();
        for item in calibrated {
            if let Some(last) = &self.last_emitted {
                let elapsed = item.reading.timestamp - last.timestamp;
                if !elapsed.is_positive() || elapsed.unsigned_abs() < spacing {
                    continue;
                }
            }

            let value = self.settings.readable_range.clamp(item.value).round();
            let slope = self
                .last_emitted
                .as_ref()
                .map(|last| slope(last.timestamp, f64::from(last.value), item.reading.timestamp, value));

            let glucose = SensorGlucose {
                id: item.reading.id,
                timestamp: item.reading.timestamp,
                raw_value: item.factory,
                value: value as u16,
                slope,
                trend: trend(slope),
            };
            self.last_emitted = Some(glucose.clone());
            emitted.push(glucose);
        }

        debug!("Emitting {} of {} readings", emitted.len(), readings.len());
        IngestOutcome::Emitted(emitted)
    }
}

/// Requests accepted by a running [`GlucoseService`].
#[derive(Debug)]
pub enum PipelineCommand {
    /// Follow another sensor.
    SetSensor(Box<Sensor>),
    /// Replace the settings.
    UpdateSettings(PipelineSettings),
    /// Restart smoothing and interval tracking.
    ResetStream,
}

/// Task owning a [`GlucosePipeline`].
///
/// Consumes `SensorPaired` and `GlucoseReadingsAdded` from the event bus and
/// publishes `GlucoseValuesAdded`, or a non-critical `ConnectionErrorRaised`
/// for a suppressed batch.
#[derive(Debug)]
pub struct GlucoseService {
    commands: mpsc::Sender<PipelineCommand>,
    cancel: CancellationToken,
    task: JoinHandle<GlucosePipeline>,
}

impl GlucoseService {
    /// Start the service. It is subscribed before this returns.
    pub fn spawn(pipeline: GlucosePipeline, events: EventDispatcher) -> Self {
        let (commands, command_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let receiver = events.subscribe();
        let task = tokio::spawn(run_service(
            pipeline,
            events,
            receiver,
            command_rx,
            cancel.clone(),
        ));
        Self {
            commands,
            cancel,
            task,
        }
    }

    /// Send a command to the service.
    pub async fn send(&self, command: PipelineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Stop the service and get the pipeline back.
    pub async fn shutdown(self) -> Result<GlucosePipeline> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| Error::Transport(format!("glucose service task failed: {}", e)))
    }
}

async fn run_service(
    mut pipeline: GlucosePipeline,
    events: EventDispatcher,
    mut receiver: broadcast::Receiver<DomainEvent>,
    mut commands: mpsc::Receiver<PipelineCommand>,
    cancel: CancellationToken,
) -> GlucosePipeline {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(command) = commands.recv() => match command {
                PipelineCommand::SetSensor(sensor) => pipeline.set_sensor(&sensor),
                PipelineCommand::UpdateSettings(settings) => {
                    if let Err(e) = pipeline.update_settings(settings) {
                        warn!("Rejected pipeline settings: {}", e);
                    }
                }
                PipelineCommand::ResetStream => pipeline.reset_stream(),
            },
            event = receiver.recv() => match event {
                Ok(DomainEvent::SensorPaired { sensor }) => pipeline.set_sensor(&sensor),
                Ok(DomainEvent::GlucoseReadingsAdded { readings }) => {
                    match pipeline.ingest(&readings) {
                        IngestOutcome::Emitted(values) if values.is_empty() => {}
                        IngestOutcome::Emitted(values) => {
                            events.send(DomainEvent::GlucoseValuesAdded { values });
                        }
                        IngestOutcome::Suppressed { stdev } => {
                            let error = ConnectionError::transient(
                                format!("Implausible glucose values suppressed (stdev {:.0})", stdev),
                                time::OffsetDateTime::now_utc(),
                            );
                            events.send(DomainEvent::ConnectionErrorRaised { error });
                        }
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Glucose service missed {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    pipeline
}
