//! btleplug driver for the connection state machine.
//!
//! [`BleDriver`] runs as a single task. It owns the adapter, the connected
//! peripheral and the [`ConnectionMachine`], and serializes everything the
//! machine sees: commands from [`DriverHandle`], adapter events, notification
//! chunks and timer expiries all arrive on one loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::{Stream, StreamExt};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cgm_types::Sensor;

use super::machine::{ConnectionMachine, ConnectionOptions, Effect, MachineEvent};
use super::scan::{advertisement_of, find_known_peripheral, format_peripheral_id};
use super::ConnectionState;
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::events::EventDispatcher;
use crate::persistence::{ConnectionPersistence, ConnectionRecord};

/// Timeouts of the individual BLE operations.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Timeout for service discovery.
    pub discovery_timeout: Duration,
    /// Timeout for characteristic writes and subscriptions.
    pub write_timeout: Duration,
    /// Capacity of the command channel.
    pub command_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            command_capacity: 16,
        }
    }
}

impl DriverConfig {
    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Requests accepted by a running driver.
#[derive(Debug)]
pub enum DriverCommand {
    /// Connect to a sensor and keep the connection up.
    Connect {
        /// Sensor to connect to.
        sensor: Box<Sensor>,
        /// Minutes between forwarded batches of readings.
        sampling_interval_minutes: u32,
    },
    /// Drop the connection and stop reconnecting.
    Disconnect,
}

/// Cloneable handle to a running [`BleDriver`].
#[derive(Debug, Clone)]
pub struct DriverHandle {
    commands: mpsc::Sender<DriverCommand>,
    cancel: CancellationToken,
}

impl DriverHandle {
    /// Connect to `sensor`, replacing any current sensor.
    pub async fn connect(&self, sensor: Sensor, sampling_interval_minutes: u32) -> Result<()> {
        self.send(DriverCommand::Connect {
            sensor: Box::new(sensor),
            sampling_interval_minutes,
        })
        .await
    }

    /// Disconnect and stay disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(DriverCommand::Disconnect).await
    }

    /// Stop the driver task. The link is dropped on the way out.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether the driver task has been asked to stop.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn send(&self, command: DriverCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Cancelled)
    }
}

/// Executes [`Effect`]s against a btleplug adapter.
pub struct BleDriver {
    adapter: Adapter,
    machine: ConnectionMachine,
    persistence: Arc<dyn ConnectionPersistence>,
    events: EventDispatcher,
    config: DriverConfig,
    cancel: CancellationToken,
    internal: mpsc::UnboundedSender<MachineEvent>,
    peripheral: Option<Peripheral>,
    write_char: Option<Characteristic>,
    notify_char: Option<Characteristic>,
    notification_task: Option<JoinHandle<()>>,
    expecting_disconnect: bool,
}

impl BleDriver {
    /// Start the driver task.
    ///
    /// The machine is seeded from `persistence` and every state change is
    /// published on `events`.
    pub fn spawn(
        adapter: Adapter,
        persistence: Arc<dyn ConnectionPersistence>,
        events: EventDispatcher,
        options: ConnectionOptions,
        config: DriverConfig,
    ) -> Result<(DriverHandle, JoinHandle<()>)> {
        options.validate()?;
        let record = ConnectionRecord {
            peripheral_id: persistence.peripheral_id(),
            unlock_count: persistence.unlock_count(),
        };
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let driver = Self {
            adapter,
            machine: ConnectionMachine::new(options, record),
            persistence,
            events,
            config,
            cancel: cancel.clone(),
            internal: internal_tx,
            peripheral: None,
            write_char: None,
            notify_char: None,
            notification_task: None,
            expecting_disconnect: false,
        };
        let task = tokio::spawn(driver.run(commands_rx, internal_rx));

        Ok((
            DriverHandle {
                commands: commands_tx,
                cancel,
            },
            task,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<DriverCommand>,
        mut internal: mpsc::UnboundedReceiver<MachineEvent>,
    ) {
        let mut central_events = match self.adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Cannot subscribe to adapter events: {}", e);
                self.feed(MachineEvent::AdapterPowered(false)).await;
                return;
            }
        };
        self.feed(MachineEvent::AdapterPowered(true)).await;

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(DriverCommand::Connect { sensor, sampling_interval_minutes }) => {
                        self.feed(MachineEvent::ConnectRequested { sensor, sampling_interval_minutes }).await;
                    }
                    Some(DriverCommand::Disconnect) => {
                        self.feed(MachineEvent::DisconnectRequested).await;
                    }
                    None => break,
                },
                Some(event) = central_events.next() => {
                    if let Some(event) = self.translate(event).await {
                        self.feed(event).await;
                    }
                }
                Some(event) = internal.recv() => self.feed(event).await,
            }
        }

        info!("Connection driver stopping");
        self.feed(MachineEvent::DisconnectRequested).await;
        self.stop_notifications();
    }

    /// Run one event through the machine, then every follow-up event the
    /// executed effects produced.
    async fn feed(&mut self, event: MachineEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let effects = self.machine.handle(event, OffsetDateTime::now_utc());
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn translate(&mut self, event: CentralEvent) -> Option<MachineEvent> {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                if self.machine.state() != ConnectionState::Scanning {
                    return None;
                }
                let peripheral = self.adapter.peripheral(&id).await.ok()?;
                match advertisement_of(&peripheral).await {
                    Ok(advertisement) => advertisement.map(MachineEvent::PeripheralDiscovered),
                    Err(e) => {
                        debug!("No properties for {}: {}", format_peripheral_id(&id), e);
                        None
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let ours = self
                    .peripheral
                    .as_ref()
                    .is_some_and(|peripheral| peripheral.id() == id);
                if !ours {
                    return None;
                }
                // A finished notification task has already reported the link loss.
                let reported = self
                    .notification_task
                    .as_ref()
                    .is_some_and(|task| task.is_finished());
                self.stop_notifications();
                if reported {
                    self.expecting_disconnect = false;
                    debug!("Disconnect already reported by the notification stream");
                    return None;
                }
                if std::mem::take(&mut self.expecting_disconnect) {
                    debug!("Ignoring disconnect we asked for");
                    return None;
                }
                Some(MachineEvent::PeripheralDisconnected(Some(
                    "link lost".to_string(),
                )))
            }
            _ => None,
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<MachineEvent> {
        match effect {
            Effect::StartScan => {
                info!("Scanning for sensor");
                if let Err(e) = self.adapter.start_scan(ScanFilter::default()).await {
                    warn!("Failed to start scan: {}", e);
                }
                None
            }
            Effect::StopScan => {
                if let Err(e) = self.adapter.stop_scan().await {
                    debug!("Failed to stop scan: {}", e);
                }
                None
            }
            Effect::RetrievePeripheral(id) => match find_known_peripheral(&self.adapter, &id).await {
                Ok(Some(peripheral)) => {
                    self.peripheral = Some(peripheral);
                    Some(MachineEvent::PeripheralRetrieved(Some(id)))
                }
                Ok(None) => Some(MachineEvent::PeripheralRetrieved(None)),
                Err(e) => {
                    debug!("Peripheral lookup failed: {}", e);
                    Some(MachineEvent::PeripheralRetrieved(None))
                }
            },
            Effect::Connect(id) => Some(self.connect(&id).await),
            Effect::Disconnect => {
                self.stop_notifications();
                self.write_char = None;
                self.notify_char = None;
                if let Some(peripheral) = &self.peripheral {
                    self.expecting_disconnect = true;
                    if let Err(e) = peripheral.disconnect().await {
                        debug!("Disconnect failed: {}", e);
                    }
                }
                None
            }
            Effect::DiscoverServices(service) => Some(self.discover_services(service).await),
            Effect::DiscoverCharacteristics { write, notify } => {
                let peripheral = self.peripheral.as_ref()?;
                let characteristics = peripheral.characteristics();
                self.write_char = characteristics.iter().find(|c| c.uuid == write).cloned();
                self.notify_char = characteristics.iter().find(|c| c.uuid == notify).cloned();
                debug!(
                    "Found {} characteristics, write: {}, notify: {}",
                    characteristics.len(),
                    self.write_char.is_some(),
                    self.notify_char.is_some()
                );
                Some(MachineEvent::CharacteristicsDiscovered {
                    write: self.write_char.is_some(),
                    notify: self.notify_char.is_some(),
                })
            }
            Effect::Write(data) => self
                .write(&data)
                .await
                .err()
                .map(|e| MachineEvent::TransportFailed(e.to_string())),
            Effect::EnableNotifications => match self.enable_notifications().await {
                Ok(()) => Some(MachineEvent::NotificationsEnabled),
                Err(e) => Some(MachineEvent::TransportFailed(e.to_string())),
            },
            Effect::ScheduleReconnect(after) => {
                debug!("Reconnecting in {:?}", after);
                self.schedule(after, MachineEvent::ReconnectElapsed);
                None
            }
            Effect::ScheduleBufferReset { generation, after } => {
                self.schedule(after, MachineEvent::BufferResetElapsed { generation });
                None
            }
            Effect::PersistPeripheral(id) => {
                if let Err(e) = self.persistence.set_peripheral_id(id) {
                    warn!("Failed to store peripheral id: {}", e);
                }
                None
            }
            Effect::PersistUnlockCount(count) => {
                if let Err(e) = self.persistence.set_unlock_count(count) {
                    warn!("Failed to store unlock count: {}", e);
                }
                None
            }
            Effect::Emit(event) => {
                self.events.send(event);
                None
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self), fields(timeout = ?self.config.connect_timeout))]
    async fn connect(&mut self, id: &str) -> MachineEvent {
        let known = self
            .peripheral
            .as_ref()
            .is_some_and(|peripheral| format_peripheral_id(&peripheral.id()) == id);
        if !known {
            match find_known_peripheral(&self.adapter, id).await {
                Ok(Some(peripheral)) => self.peripheral = Some(peripheral),
                Ok(None) => {
                    return MachineEvent::ConnectFailed(ConnectionFailureReason::OutOfRange);
                }
                Err(e) => {
                    return MachineEvent::ConnectFailed(ConnectionFailureReason::BleError(
                        e.to_string(),
                    ));
                }
            }
        }
        let Some(peripheral) = self.peripheral.as_ref() else {
            return MachineEvent::ConnectFailed(ConnectionFailureReason::OutOfRange);
        };

        self.expecting_disconnect = false;
        match timeout(self.config.connect_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {
                info!("Connected");
                MachineEvent::PeripheralConnected
            }
            Ok(Err(e)) => {
                MachineEvent::ConnectFailed(ConnectionFailureReason::BleError(e.to_string()))
            }
            Err(_) => MachineEvent::ConnectFailed(ConnectionFailureReason::Timeout),
        }
    }

    async fn discover_services(&mut self, service: Uuid) -> MachineEvent {
        let Some(peripheral) = self.peripheral.as_ref() else {
            return MachineEvent::TransportFailed("no peripheral".to_string());
        };
        let discovered = timeout(self.config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", self.config.discovery_timeout))
            .and_then(|result| result.map_err(Error::from));
        if let Err(e) = discovered {
            return MachineEvent::TransportFailed(e.to_string());
        }

        let services = peripheral.services();
        debug!("Found {} services", services.len());
        MachineEvent::ServicesDiscovered {
            found: services.iter().any(|s| s.uuid == service),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let (Some(peripheral), Some(characteristic)) = (&self.peripheral, &self.write_char) else {
            return Err(Error::Transport("write characteristic not resolved".to_string()));
        };
        timeout(
            self.config.write_timeout,
            peripheral.write(characteristic, data, WriteType::WithResponse),
        )
        .await
        .map_err(|_| Error::timeout("write characteristic", self.config.write_timeout))??;
        Ok(())
    }

    async fn enable_notifications(&mut self) -> Result<()> {
        let (Some(peripheral), Some(characteristic)) = (&self.peripheral, &self.notify_char) else {
            return Err(Error::Transport("notify characteristic not resolved".to_string()));
        };
        timeout(self.config.write_timeout, peripheral.subscribe(characteristic))
            .await
            .map_err(|_| Error::timeout("subscribe", self.config.write_timeout))??;

        let stream = peripheral.notifications().await?;
        let uuid = characteristic.uuid;
        let sink = self.internal.clone();
        self.stop_notifications();
        self.notification_task = Some(tokio::spawn(forward_notifications(stream, uuid, sink)));
        Ok(())
    }

    fn stop_notifications(&mut self) {
        if let Some(task) = self.notification_task.take() {
            task.abort();
        }
    }

    fn schedule(&self, after: Duration, event: MachineEvent) {
        let sink = self.internal.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(after) => {
                    let _ = sink.send(event);
                }
            }
        });
    }
}

/// Forward notifications of one characteristic to the driver loop.
///
/// The end of the stream is reported as a disconnect so the machine leaves
/// `Streaming` even when the adapter never reports the link loss.
async fn forward_notifications<S>(
    mut stream: S,
    uuid: Uuid,
    sink: mpsc::UnboundedSender<MachineEvent>,
) where
    S: Stream<Item = ValueNotification> + Unpin,
{
    while let Some(notification) = stream.next().await {
        if notification.uuid == uuid
            && sink
                .send(MachineEvent::Notification(notification.value))
                .is_err()
        {
            return;
        }
    }
    debug!("Notification stream ended");
    let _ = sink.send(MachineEvent::PeripheralDisconnected(Some(
        "notification stream ended".to_string(),
    )));
}

impl std::fmt::Debug for BleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleDriver")
            .field("state", &self.machine.state())
            .field("peripheral", &self.machine.peripheral_id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_config_builders() {
        let config = DriverConfig::default()
            .connect_timeout(Duration::from_secs(30))
            .discovery_timeout(Duration::from_secs(5))
            .write_timeout(Duration::from_secs(2));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.discovery_timeout, Duration::from_secs(5));
        assert_eq!(config.write_timeout, Duration::from_secs(2));
        assert_eq!(config.command_capacity, 16);
    }

    #[tokio::test]
    async fn test_notification_stream_end_reports_disconnect() {
        let uuid = cgm_types::uuids::SENSOR_NOTIFY;
        let (sink, mut events) = mpsc::unbounded_channel();
        let stream = futures::stream::iter(vec![
            ValueNotification {
                uuid,
                value: vec![0x01, 0x02],
            },
            ValueNotification {
                uuid: Uuid::nil(),
                value: vec![0xFF],
            },
        ]);

        forward_notifications(stream, uuid, sink).await;

        assert_eq!(
            events.recv().await,
            Some(MachineEvent::Notification(vec![0x01, 0x02]))
        );
        assert!(matches!(
            events.recv().await,
            Some(MachineEvent::PeripheralDisconnected(Some(_)))
        ));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_driver() {
        let (commands, receiver) = mpsc::channel(1);
        drop(receiver);
        let handle = DriverHandle {
            commands,
            cancel: CancellationToken::new(),
        };
        assert!(matches!(handle.disconnect().await, Err(Error::Cancelled)));
        handle.shutdown();
        assert!(handle.is_shutdown());
    }
}
