//! Pairing a new sensor through its NFC tag.
//!
//! A pairing session reads the sensor identity and its whole memory image,
//! decrypts it when the sensor type requires it and builds the [`Sensor`]
//! the connection and pipeline use afterwards. The session either succeeds
//! as a whole or fails with a single [`Error`]; nothing is stored on failure.

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cgm_types::{Sensor, SensorIdentity, SensorReading, SensorType};

use crate::connection::ConnectionState;
use crate::crypto::{BLOCK_COUNT, BLOCK_LEN, MEMORY_IMAGE_LEN, decrypt_memory_image};
use crate::error::{Error, Result};
use crate::events::{ConnectionError, DomainEvent, EventDispatcher};
use crate::parser::{merge_readings, parse_memory};
use crate::persistence::ConnectionPersistence;
use crate::retry::{RetryConfig, with_retry_cancellable};

/// Blocks requested per tag read.
pub const DEFAULT_BLOCKS_PER_READ: u8 = 3;

/// Access to a sensor's NFC tag.
///
/// Implemented by platform NFC bindings and by
/// [`MockTagReader`](crate::mock::MockTagReader) in tests.
#[async_trait]
pub trait TagReader: Send + Sync {
    /// Read the uid and patch info.
    async fn read_identity(&self) -> Result<SensorIdentity>;

    /// Read `count` 8-byte blocks starting at block `start`.
    async fn read_blocks(&self, start: u8, count: u8) -> Result<Vec<u8>>;

    /// End the tag session.
    async fn invalidate(&self);
}

/// Tunables of a pairing session.
#[derive(Debug, Clone)]
pub struct PairingOptions {
    /// Retry policy applied to every tag read.
    pub retry: RetryConfig,
    /// Blocks requested per read.
    pub blocks_per_read: u8,
}

impl Default for PairingOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::for_tag_read(),
            blocks_per_read: DEFAULT_BLOCKS_PER_READ,
        }
    }
}

impl PairingOptions {
    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the number of blocks per read.
    #[must_use]
    pub fn blocks_per_read(mut self, blocks: u8) -> Self {
        self.blocks_per_read = blocks;
        self
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.blocks_per_read == 0 || usize::from(self.blocks_per_read) > BLOCK_COUNT {
            return Err(Error::invalid_config(format!(
                "blocks_per_read must be between 1 and {}",
                BLOCK_COUNT
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful pairing session.
#[derive(Debug, Clone, PartialEq)]
pub struct PairingResult {
    /// The paired sensor.
    pub sensor: Sensor,
    /// Trend samples, oldest first.
    pub trend: Vec<SensorReading>,
    /// History samples, oldest first.
    pub history: Vec<SensorReading>,
}

impl PairingResult {
    /// All samples, oldest first, without duplicates.
    #[must_use]
    pub fn readings(&self) -> Vec<SensorReading> {
        merge_readings(&self.history, &self.trend)
    }
}

/// Read and decode a sensor through its tag.
///
/// Every read is retried according to `options.retry`. The tag session is
/// invalidated when this returns, whatever the outcome.
#[tracing::instrument(level = "info", skip_all)]
pub async fn pair<R>(
    reader: &R,
    options: &PairingOptions,
    cancel: &CancellationToken,
) -> Result<PairingResult>
where
    R: TagReader + ?Sized,
{
    options.validate()?;
    let result = read_sensor(reader, options, cancel).await;
    if let Err(e) = &result {
        warn!("Pairing failed: {}", e);
    }
    reader.invalidate().await;
    result
}

async fn read_sensor<R>(
    reader: &R,
    options: &PairingOptions,
    cancel: &CancellationToken,
) -> Result<PairingResult>
where
    R: TagReader + ?Sized,
{
    let identity =
        with_retry_cancellable(&options.retry, "read_identity", cancel, || reader.read_identity())
            .await?;
    let sensor_type = identity.sensor_type();
    if matches!(sensor_type, SensorType::LibrePro | SensorType::Unknown) {
        return Err(Error::protocol(format!(
            "unsupported sensor {} ({})",
            identity.serial, sensor_type
        )));
    }
    info!("Reading sensor {} ({})", identity.serial, sensor_type);

    let mut image = Vec::with_capacity(MEMORY_IMAGE_LEN);
    let step = usize::from(options.blocks_per_read);
    let mut start = 0usize;
    while start < BLOCK_COUNT {
        let count = step.min(BLOCK_COUNT - start);
        let blocks = with_retry_cancellable(&options.retry, "read_blocks", cancel, || async move {
            let bytes = reader.read_blocks(start as u8, count as u8).await?;
            if bytes.len() != count * BLOCK_LEN {
                return Err(Error::Transport(format!(
                    "short tag read at block {}: {} of {} bytes",
                    start,
                    bytes.len(),
                    count * BLOCK_LEN
                )));
            }
            Ok(bytes)
        })
        .await?;
        image.extend_from_slice(&blocks);
        start += count;
    }

    let read_at = OffsetDateTime::now_utc();
    let memory = decrypt_memory_image(sensor_type, &identity.uid, &identity.patch_info, &image)?;
    let parsed = parse_memory(&identity, read_at, &memory)?;
    let sensor = parsed.to_sensor(identity, read_at);
    info!(
        "Paired sensor {}: {}, age {} min of {}",
        sensor.serial(),
        sensor.state,
        sensor.age,
        sensor.lifetime
    );

    Ok(PairingResult {
        sensor,
        trend: parsed.trend,
        history: parsed.history,
    })
}

/// Pair a sensor and publish the outcome.
///
/// On success the connection state of the previous sensor is forgotten and
/// `SensorPaired`, `SensorStateChanged` and, for a ready sensor, the initial
/// `GlucoseReadingsAdded` are emitted. On failure exactly one
/// `ConnectionErrorRaised` is emitted, critical only for unsupported
/// sensors, and the state returns to `Disconnected`.
pub async fn pair_sensor<R>(
    reader: &R,
    options: &PairingOptions,
    cancel: &CancellationToken,
    persistence: &dyn ConnectionPersistence,
    events: &EventDispatcher,
) -> Result<PairingResult>
where
    R: TagReader + ?Sized,
{
    events.send(DomainEvent::ConnectionStateChanged {
        state: ConnectionState::Pairing,
    });
    let outcome = match pair(reader, options, cancel).await {
        Ok(result) => persistence.reset_for_pairing().map(|()| result),
        Err(e) => Err(e),
    };
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            let now = OffsetDateTime::now_utc();
            let message = format!("Pairing failed: {}", e);
            let error = if matches!(e, Error::Protocol(_)) {
                ConnectionError::critical(message, now)
            } else {
                ConnectionError::transient(message, now)
            };
            events.send(DomainEvent::ConnectionErrorRaised { error });
            events.send(DomainEvent::ConnectionStateChanged {
                state: ConnectionState::Disconnected,
            });
            return Err(e);
        }
    };

    let sensor = &result.sensor;
    events.send(DomainEvent::SensorPaired {
        sensor: Box::new(sensor.clone()),
    });
    events.send(DomainEvent::SensorStateChanged {
        age: sensor.age,
        state: sensor.state,
    });
    if sensor.is_ready() {
        events.send(DomainEvent::GlucoseReadingsAdded {
            readings: result.readings(),
        });
    }
    Ok(result)
}
