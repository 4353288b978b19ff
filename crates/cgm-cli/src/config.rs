//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cgm_core::ReconnectOptions;
use cgm_core::calibration::ReadableRange;
use cgm_core::pipeline::PipelineSettings;
use cgm_types::{CustomCalibrationPoint, FactoryCalibration, SensorIdentity};
use serde::{Deserialize, Serialize};

use crate::util::{parse_patch_info, parse_uid};

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where the peripheral id and unlock counter are kept
    #[serde(default)]
    pub persistence_path: Option<PathBuf>,

    /// Sensor to stream from
    #[serde(default)]
    pub sensor: Option<SensorConfig>,

    /// Glucose processing settings
    #[serde(default)]
    pub glucose: GlucoseConfig,

    /// Reconnection backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Remembered sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Uid as hex
    pub uid: String,
    /// Patch info as hex
    pub patch_info: String,
    /// Factory calibration, known once a memory image was decoded
    #[serde(default)]
    pub calibration: Option<FactoryCalibration>,
}

/// Glucose processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseConfig {
    /// Minutes between values
    #[serde(default = "default_interval")]
    pub sampling_interval: u32,

    /// Lowest displayed value in mg/dL
    #[serde(default = "default_min")]
    pub min: f64,

    /// Highest displayed value in mg/dL
    #[serde(default = "default_max")]
    pub max: f64,

    /// Smooth values with a Kalman filter
    #[serde(default = "default_true")]
    pub smoothing: bool,

    /// Filter noise
    #[serde(default = "default_noise")]
    pub filter_noise: f64,

    /// Reference points `[sensor, meter]` for custom calibration
    #[serde(default)]
    pub calibration: Vec<[f64; 2]>,
}

fn default_interval() -> u32 {
    5
}

fn default_min() -> f64 {
    ReadableRange::STANDARD.min
}

fn default_max() -> f64 {
    ReadableRange::STANDARD.max
}

fn default_true() -> bool {
    true
}

fn default_noise() -> f64 {
    cgm_core::calibration::DEFAULT_FILTER_NOISE
}

impl Default for GlucoseConfig {
    fn default() -> Self {
        Self {
            sampling_interval: default_interval(),
            min: default_min(),
            max: default_max(),
            smoothing: true,
            filter_noise: default_noise(),
            calibration: Vec::new(),
        }
    }
}

/// Reconnection backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Failed attempts before rescanning (0 for never)
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,

    /// First delay in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Longest delay in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    60
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cgm")
            .join("config.toml")
    }

    /// Load config from file, or return default if not found
    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Identity of the configured sensor, if any
    pub fn sensor_identity(&self) -> Result<Option<SensorIdentity>> {
        let Some(sensor) = &self.sensor else {
            return Ok(None);
        };
        let uid = parse_uid(&sensor.uid).context("Invalid sensor uid in config")?;
        let patch_info =
            parse_patch_info(&sensor.patch_info).context("Invalid sensor patch info in config")?;
        Ok(Some(SensorIdentity::new(uid, patch_info)))
    }

    /// Pipeline settings, optionally with another sampling interval
    pub fn pipeline_settings(&self, interval: Option<u32>) -> Result<PipelineSettings> {
        let glucose = &self.glucose;
        let settings = PipelineSettings {
            sampling_interval_minutes: interval.unwrap_or(glucose.sampling_interval),
            readable_range: ReadableRange::new(glucose.min, glucose.max),
            custom_calibration: glucose
                .calibration
                .iter()
                .map(|[x, y]| CustomCalibrationPoint::new(*x, *y))
                .collect(),
            smoothing: glucose.smoothing,
            filter_noise: glucose.filter_noise,
            ..Default::default()
        };
        settings.validate().context("Invalid glucose settings")?;
        Ok(settings)
    }

    /// Reconnection options
    pub fn reconnect_options(&self) -> Result<ReconnectOptions> {
        let reconnect = &self.reconnect;
        if reconnect.initial_delay_secs > reconnect.max_delay_secs {
            bail!("reconnect.initial_delay_secs must not exceed reconnect.max_delay_secs");
        }
        let mut options = if reconnect.max_attempts == 0 {
            ReconnectOptions::unlimited()
        } else {
            ReconnectOptions::default().max_attempts(reconnect.max_attempts)
        };
        options = options
            .initial_delay(Duration::from_secs(reconnect.initial_delay_secs))
            .max_delay(Duration::from_secs(reconnect.max_delay_secs));
        options.validate().context("Invalid reconnect settings")?;
        Ok(options)
    }

    /// Connection persistence file
    pub fn persistence_path(&self) -> PathBuf {
        self.persistence_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("cgm")
                .join("connection.json")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config, Config::default());
        assert_eq!(config.glucose.sampling_interval, 5);
        assert!(config.glucose.smoothing);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            sensor: Some(SensorConfig {
                uid: "2fe7b10000a407e0".into(),
                patch_info: "9d0830017625".into(),
                calibration: Some(FactoryCalibration {
                    i1: 1,
                    i2: 300,
                    i3: 20,
                    i4: 1020,
                    i5: 10000,
                    i6: 16000,
                }),
            }),
            glucose: GlucoseConfig {
                calibration: vec![[100.0, 110.0], [200.0, 210.0]],
                ..Default::default()
            },
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[glucose]\nsampling_interval = 1\n").unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.glucose.sampling_interval, 1);
        assert_eq!(config.glucose.max, 500.0);
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn test_sensor_identity() {
        let config = Config {
            sensor: Some(SensorConfig {
                uid: "2F E7 B1 00 00 A4 07 E0".into(),
                patch_info: "9d:08:30:01:76:25".into(),
                calibration: None,
            }),
            ..Default::default()
        };
        let identity = config.sensor_identity().unwrap().unwrap();
        assert_eq!(identity.serial, "3MH001DG75W");

        assert!(Config::default().sensor_identity().unwrap().is_none());
    }

    #[test]
    fn test_pipeline_settings() {
        let config = Config::default();
        let settings = config.pipeline_settings(Some(1)).unwrap();
        assert_eq!(settings.sampling_interval_minutes, 1);
        assert_eq!(settings.readable_range, ReadableRange::STANDARD);

        let mut bad = Config::default();
        bad.glucose.min = 600.0;
        assert!(bad.pipeline_settings(None).is_err());
    }

    #[test]
    fn test_reconnect_options() {
        let mut config = Config::default();
        let options = config.reconnect_options().unwrap();
        assert_eq!(options.max_attempts, Some(5));

        config.reconnect.max_attempts = 0;
        assert_eq!(config.reconnect_options().unwrap().max_attempts, None);

        config.reconnect.initial_delay_secs = 120;
        assert!(config.reconnect_options().is_err());
    }
}
