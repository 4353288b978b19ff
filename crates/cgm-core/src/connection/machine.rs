//! Pure connection state machine.
//!
//! [`ConnectionMachine::handle`] takes one [`MachineEvent`] and returns the
//! [`Effect`]s to perform. It never touches Bluetooth, timers or storage, so
//! every transition can be driven and checked from a plain unit test. The
//! [`BleDriver`](super::driver::BleDriver) executes effects against btleplug
//! and feeds their outcome back in as events.
//!
//! ```text
//! Unknown ─▶ PoweredOn ─▶ Scanning ─▶ Connecting ─▶ Connected ─▶ Streaming
//!                              ▲            ▲                        │
//!                              │            └──── Disconnected ◀─────┘
//!                              └─── (attempts exhausted)
//! ```

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cgm_types::{Sensor, SensorReading};

use super::ConnectionState;
use super::frame::{Assembly, FrameAssembler};
use super::profile::{Advertisement, CryptoGeneration, FamilyProfile};
use crate::crypto::{
    DEFAULT_ENABLE_TIME, build_unlock_payload, decrypt_memory_image, decrypt_streaming_packet,
};
use crate::error::{ConnectionFailureReason, Error, ErrorKind, Result};
use crate::events::{ConnectionError, DomainEvent};
use crate::parser::{merge_readings, parse_memory, parse_streaming_frame};
use crate::persistence::ConnectionRecord;
use crate::reconnect::ReconnectOptions;

/// Default slack subtracted from the sampling interval when gating readings.
pub const DEFAULT_INTERVAL_GUARD: Duration = Duration::from_secs(15);

/// Default delay after which a partial frame is dropped.
pub const DEFAULT_BUFFER_RESET_DELAY: Duration = Duration::from_secs(2);

/// Tunables of the connection state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Backoff after failed connection attempts.
    pub reconnect: ReconnectOptions,
    /// Partial frames older than this are dropped.
    pub buffer_reset_delay: Duration,
    /// Slack subtracted from the sampling interval when gating readings.
    pub interval_guard: Duration,
    /// Enable time mixed into the unlock payload.
    pub enable_time: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectOptions::default(),
            buffer_reset_delay: DEFAULT_BUFFER_RESET_DELAY,
            interval_guard: DEFAULT_INTERVAL_GUARD,
            enable_time: DEFAULT_ENABLE_TIME,
        }
    }
}

impl ConnectionOptions {
    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate()?;
        if self.buffer_reset_delay.is_zero() {
            return Err(Error::invalid_config("buffer_reset_delay must be > 0"));
        }
        Ok(())
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// The adapter was switched on or off.
    AdapterPowered(bool),
    /// Start (and keep) a connection to a sensor.
    ConnectRequested {
        /// Sensor to connect to.
        sensor: Box<Sensor>,
        /// Minutes between forwarded batches of readings.
        sampling_interval_minutes: u32,
    },
    /// Drop the connection and stop reconnecting.
    DisconnectRequested,
    /// Outcome of [`Effect::RetrievePeripheral`]: the id if the adapter knows it.
    PeripheralRetrieved(Option<String>),
    /// A scan result.
    PeripheralDiscovered(Advertisement),
    /// The link is up.
    PeripheralConnected,
    /// A connection attempt failed.
    ConnectFailed(ConnectionFailureReason),
    /// The link went down, with a reason if one is known.
    PeripheralDisconnected(Option<String>),
    /// Outcome of [`Effect::DiscoverServices`].
    ServicesDiscovered {
        /// Whether the profile's service is present.
        found: bool,
    },
    /// Outcome of [`Effect::DiscoverCharacteristics`].
    CharacteristicsDiscovered {
        /// Whether the write characteristic is present.
        write: bool,
        /// Whether the notify characteristic is present.
        notify: bool,
    },
    /// A write, subscription or discovery call failed.
    TransportFailed(String),
    /// Notifications are flowing.
    NotificationsEnabled,
    /// One notification from the notify characteristic.
    Notification(Vec<u8>),
    /// The backoff timer of [`Effect::ScheduleReconnect`] fired.
    ReconnectElapsed,
    /// The timer of [`Effect::ScheduleBufferReset`] fired.
    BufferResetElapsed {
        /// Frame generation the timer was started for.
        generation: u64,
    },
}

/// Work requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start scanning for peripherals.
    StartScan,
    /// Stop scanning.
    StopScan,
    /// Look up a remembered peripheral without scanning.
    RetrievePeripheral(String),
    /// Connect to a peripheral.
    Connect(String),
    /// Drop the current link.
    Disconnect,
    /// Discover GATT services and check for one.
    DiscoverServices(Uuid),
    /// Resolve the data characteristics.
    DiscoverCharacteristics {
        /// Write characteristic.
        write: Uuid,
        /// Notify characteristic.
        notify: Uuid,
    },
    /// Write to the write characteristic (with response).
    Write(Vec<u8>),
    /// Subscribe to the notify characteristic.
    EnableNotifications,
    /// Send [`MachineEvent::ReconnectElapsed`] after a delay.
    ScheduleReconnect(Duration),
    /// Send [`MachineEvent::BufferResetElapsed`] after a delay.
    ScheduleBufferReset {
        /// Frame generation to expire.
        generation: u64,
        /// Delay before expiring.
        after: Duration,
    },
    /// Store (or forget) the peripheral id.
    PersistPeripheral(Option<String>),
    /// Store the unlock counter.
    PersistUnlockCount(u16),
    /// Publish a domain event.
    Emit(DomainEvent),
}

/// Connection state machine for one sensor.
#[derive(Debug)]
pub struct ConnectionMachine {
    options: ConnectionOptions,
    state: ConnectionState,
    adapter_on: bool,
    sensor: Option<Sensor>,
    profile: Option<FamilyProfile>,
    assembler: Option<FrameAssembler>,
    sampling_interval_minutes: u32,
    stay_connected: bool,
    peripheral_id: Option<String>,
    unlock_count: u16,
    failures: u32,
    reconnect_pending: bool,
    last_forwarded: Option<OffsetDateTime>,
}

impl ConnectionMachine {
    /// Create a machine from persisted connection state.
    pub fn new(options: ConnectionOptions, record: ConnectionRecord) -> Self {
        Self {
            options,
            state: ConnectionState::Unknown,
            adapter_on: false,
            sensor: None,
            profile: None,
            assembler: None,
            sampling_interval_minutes: 1,
            stay_connected: false,
            peripheral_id: record.peripheral_id,
            unlock_count: record.unlock_count,
            failures: 0,
            reconnect_pending: false,
            last_forwarded: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sensor being connected to, with its latest age and state.
    pub fn sensor(&self) -> Option<&Sensor> {
        self.sensor.as_ref()
    }

    /// Profile selected for the sensor.
    pub fn profile(&self) -> Option<&FamilyProfile> {
        self.profile.as_ref()
    }

    /// Remembered peripheral id.
    pub fn peripheral_id(&self) -> Option<&str> {
        self.peripheral_id.as_deref()
    }

    /// Unlock payloads sent so far.
    pub fn unlock_count(&self) -> u16 {
        self.unlock_count
    }

    /// Consecutive failed connection attempts.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the machine reconnects after losing the link.
    pub fn stay_connected(&self) -> bool {
        self.stay_connected
    }

    /// Process one event.
    pub fn handle(&mut self, event: MachineEvent, now: OffsetDateTime) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            MachineEvent::AdapterPowered(on) => self.on_adapter(on, &mut effects),
            MachineEvent::ConnectRequested {
                sensor,
                sampling_interval_minutes,
            } => self.on_connect_requested(*sensor, sampling_interval_minutes, &mut effects),
            MachineEvent::DisconnectRequested => self.on_disconnect_requested(&mut effects),
            MachineEvent::PeripheralRetrieved(id) => self.on_retrieved(id, &mut effects),
            MachineEvent::PeripheralDiscovered(advertisement) => {
                self.on_discovered(advertisement, &mut effects)
            }
            MachineEvent::PeripheralConnected => {
                if self.state == ConnectionState::Connecting {
                    if let Some(profile) = &self.profile {
                        let service = profile.service;
                        self.set_state(ConnectionState::Connected, &mut effects);
                        effects.push(Effect::DiscoverServices(service));
                    }
                }
            }
            MachineEvent::ConnectFailed(reason) => {
                if self.state == ConnectionState::Connecting {
                    self.on_failure(reason.to_string(), now, &mut effects);
                }
            }
            MachineEvent::PeripheralDisconnected(reason) => {
                self.on_peripheral_disconnected(reason, now, &mut effects)
            }
            MachineEvent::ServicesDiscovered { found } => {
                self.on_services(found, now, &mut effects)
            }
            MachineEvent::CharacteristicsDiscovered { write, notify } => {
                self.on_characteristics(write, notify, now, &mut effects)
            }
            MachineEvent::TransportFailed(message) => {
                if self.is_linked() || self.state == ConnectionState::Connecting {
                    effects.push(Effect::Disconnect);
                    self.on_failure(message, now, &mut effects);
                } else {
                    warn!("Transport failure while {}: {}", self.state, message);
                }
            }
            MachineEvent::NotificationsEnabled => {
                if self.state == ConnectionState::Connected {
                    self.failures = 0;
                    self.set_state(ConnectionState::Streaming, &mut effects);
                }
            }
            MachineEvent::Notification(chunk) => self.on_notification(&chunk, now, &mut effects),
            MachineEvent::ReconnectElapsed => {
                if self.reconnect_pending {
                    self.reconnect_pending = false;
                    if self.can_connect() && self.state == ConnectionState::Disconnected {
                        self.connect_or_scan(&mut effects);
                    }
                }
            }
            MachineEvent::BufferResetElapsed { generation } => {
                if let Some(assembler) = self.assembler.as_mut() {
                    assembler.expire(generation);
                }
            }
        }
        effects
    }

    fn set_state(&mut self, state: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state != state {
            debug!("Connection state {} -> {}", self.state, state);
            self.state = state;
            effects.push(Effect::Emit(DomainEvent::ConnectionStateChanged { state }));
        }
    }

    fn is_linked(&self) -> bool {
        self.state.is_linked()
    }

    fn can_connect(&self) -> bool {
        self.stay_connected && self.adapter_on && self.sensor.is_some()
    }

    fn reset_assembler(&mut self) {
        if let Some(assembler) = self.assembler.as_mut() {
            assembler.reset();
        }
    }

    fn on_adapter(&mut self, on: bool, effects: &mut Vec<Effect>) {
        self.adapter_on = on;
        if on {
            if matches!(
                self.state,
                ConnectionState::Unknown | ConnectionState::PoweredOff
            ) {
                self.set_state(ConnectionState::PoweredOn, effects);
                if self.can_connect() {
                    self.begin_connect(effects);
                }
            }
        } else {
            info!("Bluetooth adapter powered off");
            self.reconnect_pending = false;
            self.reset_assembler();
            self.set_state(ConnectionState::PoweredOff, effects);
        }
    }

    fn on_connect_requested(
        &mut self,
        sensor: Sensor,
        sampling_interval_minutes: u32,
        effects: &mut Vec<Effect>,
    ) {
        info!(
            "Connecting to sensor {} every {} min",
            sensor.serial(),
            sampling_interval_minutes
        );
        let replaced = self
            .sensor
            .as_ref()
            .is_some_and(|previous| previous.identity != sensor.identity);
        if replaced {
            // Peripheral and unlock counter belong to the previous sensor.
            self.peripheral_id = None;
            self.unlock_count = 0;
        }
        let profile = FamilyProfile::for_sensor(&sensor);
        self.assembler = Some(FrameAssembler::new(&profile));
        self.profile = Some(profile);
        self.sensor = Some(sensor);
        self.sampling_interval_minutes = sampling_interval_minutes.max(1);
        self.stay_connected = true;
        self.failures = 0;
        self.reconnect_pending = false;
        self.last_forwarded = None;

        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Streaming => {
                effects.push(Effect::Disconnect);
                self.set_state(ConnectionState::Disconnected, effects);
                if self.adapter_on {
                    self.begin_connect(effects);
                }
            }
            ConnectionState::Scanning => {}
            _ if self.adapter_on => self.begin_connect(effects),
            _ => debug!("Adapter not powered, connection deferred"),
        }
    }

    fn on_disconnect_requested(&mut self, effects: &mut Vec<Effect>) {
        self.stay_connected = false;
        self.reconnect_pending = false;
        self.reset_assembler();
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Streaming => {
                effects.push(Effect::Disconnect);
                self.set_state(ConnectionState::Disconnected, effects);
            }
            ConnectionState::Scanning => {
                effects.push(Effect::StopScan);
                self.set_state(ConnectionState::Disconnected, effects);
            }
            _ => {}
        }
    }

    /// First connection after a request: retrieve the remembered peripheral
    /// or scan for one.
    fn begin_connect(&mut self, effects: &mut Vec<Effect>) {
        match self.peripheral_id.clone() {
            Some(id) => {
                self.set_state(ConnectionState::Connecting, effects);
                effects.push(Effect::RetrievePeripheral(id));
            }
            None => self.start_scan(effects),
        }
    }

    /// Reconnection: connect straight to the remembered peripheral.
    fn connect_or_scan(&mut self, effects: &mut Vec<Effect>) {
        match self.peripheral_id.clone() {
            Some(id) => {
                self.set_state(ConnectionState::Connecting, effects);
                effects.push(Effect::Connect(id));
            }
            None => self.start_scan(effects),
        }
    }

    fn start_scan(&mut self, effects: &mut Vec<Effect>) {
        self.set_state(ConnectionState::Scanning, effects);
        effects.push(Effect::StartScan);
    }

    fn on_retrieved(&mut self, id: Option<String>, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        match id {
            Some(id) => effects.push(Effect::Connect(id)),
            None => {
                debug!("Remembered peripheral unknown to the adapter, scanning");
                self.start_scan(effects);
            }
        }
    }

    fn on_discovered(&mut self, advertisement: Advertisement, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        let (Some(profile), Some(sensor)) = (&self.profile, &self.sensor) else {
            return;
        };
        if !profile.matches(&advertisement, sensor) {
            return;
        }

        info!(
            "Found {} peripheral {} ({:?})",
            profile.name, advertisement.id, advertisement.name
        );
        effects.push(Effect::StopScan);
        self.peripheral_id = Some(advertisement.id.clone());
        effects.push(Effect::PersistPeripheral(Some(advertisement.id.clone())));
        self.set_state(ConnectionState::Connecting, effects);
        effects.push(Effect::Connect(advertisement.id));
    }

    fn on_failure(&mut self, message: String, now: OffsetDateTime, effects: &mut Vec<Effect>) {
        self.reset_assembler();
        self.failures += 1;
        warn!(
            "Connection attempt {} failed: {}",
            self.failures, message
        );

        if !self.stay_connected {
            self.set_state(ConnectionState::Disconnected, effects);
            return;
        }

        if self.options.reconnect.is_exhausted(self.failures) {
            let error = ConnectionError::critical(
                format!(
                    "Sensor unreachable after {} attempts: {}",
                    self.failures, message
                ),
                now,
            );
            effects.push(Effect::Emit(DomainEvent::ConnectionErrorRaised { error }));
            self.failures = 0;
            self.peripheral_id = None;
            effects.push(Effect::PersistPeripheral(None));
            if self.adapter_on {
                self.start_scan(effects);
            } else {
                self.set_state(ConnectionState::Disconnected, effects);
            }
            return;
        }

        let error = ConnectionError::transient(message, now);
        effects.push(Effect::Emit(DomainEvent::ConnectionErrorRaised { error }));
        self.set_state(ConnectionState::Disconnected, effects);
        self.reconnect_pending = true;
        effects.push(Effect::ScheduleReconnect(
            self.options.reconnect.delay_for_attempt(self.failures - 1),
        ));
    }

    fn on_peripheral_disconnected(
        &mut self,
        reason: Option<String>,
        now: OffsetDateTime,
        effects: &mut Vec<Effect>,
    ) {
        match self.state {
            ConnectionState::Connecting => {
                let message = reason.unwrap_or_else(|| "disconnected while connecting".into());
                self.on_failure(message, now, effects);
            }
            ConnectionState::Connected | ConnectionState::Streaming => {
                info!(
                    "Peripheral disconnected: {}",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.reset_assembler();
                self.set_state(ConnectionState::Disconnected, effects);
                if self.can_connect() {
                    self.connect_or_scan(effects);
                }
            }
            _ => {}
        }
    }

    fn on_services(&mut self, found: bool, now: OffsetDateTime, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(profile) = &self.profile else {
            return;
        };
        if found {
            effects.push(Effect::DiscoverCharacteristics {
                write: profile.write,
                notify: profile.notify,
            });
        } else {
            effects.push(Effect::Disconnect);
            self.on_failure(
                ConnectionFailureReason::ServiceMissing.to_string(),
                now,
                effects,
            );
        }
    }

    fn on_characteristics(
        &mut self,
        write: bool,
        notify: bool,
        now: OffsetDateTime,
        effects: &mut Vec<Effect>,
    ) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let (Some(profile), Some(sensor)) = (&self.profile, &self.sensor) else {
            return;
        };
        let needs_write = profile.requires_unlock || profile.start_command.is_some();
        if !notify || (needs_write && !write) {
            let missing = if notify { profile.write } else { profile.notify };
            effects.push(Effect::Disconnect);
            self.on_failure(format!("Characteristic not found: {}", missing), now, effects);
            return;
        }

        let mut writes = Vec::new();
        if profile.requires_unlock {
            self.unlock_count = self.unlock_count.wrapping_add(1);
            effects.push(Effect::PersistUnlockCount(self.unlock_count));
            writes.push(
                build_unlock_payload(
                    &sensor.identity.uid,
                    &sensor.identity.patch_info,
                    self.options.enable_time,
                    self.unlock_count,
                )
                .to_vec(),
            );
        }
        if let Some(command) = profile.start_command {
            writes.push(command.to_vec());
        }
        effects.extend(writes.into_iter().map(Effect::Write));
        effects.push(Effect::EnableNotifications);
    }

    fn on_notification(&mut self, chunk: &[u8], now: OffsetDateTime, effects: &mut Vec<Effect>) {
        if !self.is_linked() {
            return;
        }
        let Some(assembler) = self.assembler.as_mut() else {
            return;
        };
        match assembler.push(chunk) {
            Assembly::Pending { first: true } => {
                effects.push(Effect::ScheduleBufferReset {
                    generation: assembler.generation(),
                    after: self.options.buffer_reset_delay,
                });
            }
            Assembly::Pending { first: false } | Assembly::Ignored => {}
            Assembly::Complete(frame) => self.on_frame(&frame, now, effects),
        }
    }

    fn on_frame(&mut self, frame: &[u8], now: OffsetDateTime, effects: &mut Vec<Effect>) {
        let Some(crypto) = self.profile.as_ref().map(|p| p.crypto) else {
            return;
        };
        let Some(sensor) = self.sensor.as_mut() else {
            return;
        };

        let readings = match decode_frame(crypto, sensor, frame, now) {
            Ok(readings) => readings,
            Err(e) if e.kind() == ErrorKind::Integrity => {
                warn!("Dropping frame: {}", e);
                return;
            }
            Err(e) => {
                warn!("Undecodable frame: {}", e);
                let error = ConnectionError::transient(e.to_string(), now);
                effects.push(Effect::Emit(DomainEvent::ConnectionErrorRaised { error }));
                return;
            }
        };

        sensor.set_start_from(now);
        effects.push(Effect::Emit(DomainEvent::SensorStateChanged {
            age: sensor.age,
            state: sensor.state,
        }));
        if !sensor.is_ready() {
            debug!(
                "Sensor {} is {}, readings held back",
                sensor.serial(),
                sensor.state
            );
            return;
        }

        if self.should_forward(now) {
            self.last_forwarded = Some(now);
            effects.push(Effect::Emit(DomainEvent::GlucoseReadingsAdded { readings }));
        } else {
            debug!("Frame inside the sampling interval, readings held back");
        }
    }

    fn should_forward(&self, now: OffsetDateTime) -> bool {
        if self.sampling_interval_minutes <= 1 {
            return true;
        }
        let Some(last) = self.last_forwarded else {
            return true;
        };
        let interval = Duration::from_secs(u64::from(self.sampling_interval_minutes) * 60);
        let threshold = interval.saturating_sub(self.options.interval_guard);
        (now - last).as_seconds_f64() >= threshold.as_secs_f64()
    }
}

/// Decrypt and parse one frame, updating the sensor's age and state.
fn decode_frame(
    crypto: CryptoGeneration,
    sensor: &mut Sensor,
    frame: &[u8],
    now: OffsetDateTime,
) -> Result<Vec<SensorReading>> {
    let identity = &sensor.identity;
    match crypto {
        CryptoGeneration::Streaming => {
            let payload = decrypt_streaming_packet(&identity.uid, frame)?;
            let parsed = parse_streaming_frame(
                &identity.uid,
                &sensor.factory_calibration,
                now,
                &payload,
            )?;
            sensor.update_age(parsed.age);
            Ok(merge_readings(&parsed.history, &parsed.trend))
        }
        CryptoGeneration::Memory => {
            let memory = decrypt_memory_image(
                sensor.sensor_type,
                &identity.uid,
                &identity.patch_info,
                frame,
            )?;
            let parsed = parse_memory(identity, now, &memory)?;
            if parsed.lifetime > 0 {
                sensor.lifetime = parsed.lifetime;
            }
            sensor.update_age(parsed.age);
            sensor.apply_state_flag(parsed.state);
            Ok(parsed.readings())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{StreamingPacketBuilder, sample_sensor};
    use cgm_types::uuids::{SENSOR_NOTIFY, SENSOR_SERVICE, SENSOR_WRITE};
    use cgm_types::{SensorState, UID_LEN};
    use std::collections::HashMap;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn remembered() -> ConnectionRecord {
        ConnectionRecord {
            peripheral_id: Some("p1".into()),
            unlock_count: 0,
        }
    }

    fn emitted_state(state: ConnectionState) -> Effect {
        Effect::Emit(DomainEvent::ConnectionStateChanged { state })
    }

    fn connect_request(interval: u32) -> MachineEvent {
        MachineEvent::ConnectRequested {
            sensor: Box::new(sample_sensor(t0())),
            sampling_interval_minutes: interval,
        }
    }

    /// Drive a machine with a remembered peripheral up to `Streaming`.
    fn streaming_machine(interval: u32) -> ConnectionMachine {
        let mut machine = ConnectionMachine::new(ConnectionOptions::default(), remembered());
        for event in [
            MachineEvent::AdapterPowered(true),
            connect_request(interval),
            MachineEvent::PeripheralRetrieved(Some("p1".into())),
            MachineEvent::PeripheralConnected,
            MachineEvent::ServicesDiscovered { found: true },
            MachineEvent::CharacteristicsDiscovered {
                write: true,
                notify: true,
            },
            MachineEvent::NotificationsEnabled,
        ] {
            machine.handle(event, t0());
        }
        assert_eq!(machine.state(), ConnectionState::Streaming);
        machine
    }

    fn feed_packet(
        machine: &mut ConnectionMachine,
        packet: &[u8],
        now: OffsetDateTime,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut offset = 0;
        for size in FamilyProfile::libre2_direct().chunk_sizes {
            effects.extend(machine.handle(
                MachineEvent::Notification(packet[offset..offset + size].to_vec()),
                now,
            ));
            offset += size;
        }
        effects
    }

    fn uid() -> [u8; UID_LEN] {
        sample_sensor(t0()).identity.uid
    }

    fn readings_events(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::Emit(DomainEvent::GlucoseReadingsAdded { .. })))
            .count()
    }

    #[test]
    fn test_connect_to_remembered_peripheral() {
        let mut machine = ConnectionMachine::new(ConnectionOptions::default(), remembered());

        assert_eq!(
            machine.handle(MachineEvent::AdapterPowered(true), t0()),
            vec![emitted_state(ConnectionState::PoweredOn)]
        );
        assert_eq!(
            machine.handle(connect_request(5), t0()),
            vec![
                emitted_state(ConnectionState::Connecting),
                Effect::RetrievePeripheral("p1".into()),
            ]
        );
        assert_eq!(
            machine.handle(MachineEvent::PeripheralRetrieved(Some("p1".into())), t0()),
            vec![Effect::Connect("p1".into())]
        );
        assert_eq!(
            machine.handle(MachineEvent::PeripheralConnected, t0()),
            vec![
                emitted_state(ConnectionState::Connected),
                Effect::DiscoverServices(SENSOR_SERVICE),
            ]
        );
        assert_eq!(
            machine.handle(MachineEvent::ServicesDiscovered { found: true }, t0()),
            vec![Effect::DiscoverCharacteristics {
                write: SENSOR_WRITE,
                notify: SENSOR_NOTIFY,
            }]
        );

        let sensor = sample_sensor(t0());
        let unlock = build_unlock_payload(
            &sensor.identity.uid,
            &sensor.identity.patch_info,
            DEFAULT_ENABLE_TIME,
            1,
        );
        assert_eq!(
            machine.handle(
                MachineEvent::CharacteristicsDiscovered {
                    write: true,
                    notify: true
                },
                t0()
            ),
            vec![
                Effect::PersistUnlockCount(1),
                Effect::Write(unlock.to_vec()),
                Effect::EnableNotifications,
            ]
        );
        assert_eq!(
            machine.handle(MachineEvent::NotificationsEnabled, t0()),
            vec![emitted_state(ConnectionState::Streaming)]
        );
    }

    #[test]
    fn test_connect_deferred_until_adapter_powered() {
        let mut machine = ConnectionMachine::new(ConnectionOptions::default(), remembered());
        assert!(machine.handle(connect_request(1), t0()).is_empty());
        assert_eq!(
            machine.handle(MachineEvent::AdapterPowered(true), t0()),
            vec![
                emitted_state(ConnectionState::PoweredOn),
                emitted_state(ConnectionState::Connecting),
                Effect::RetrievePeripheral("p1".into()),
            ]
        );
    }

    #[test]
    fn test_unknown_peripheral_falls_back_to_scan() {
        let mut machine = ConnectionMachine::new(ConnectionOptions::default(), remembered());
        machine.handle(MachineEvent::AdapterPowered(true), t0());
        machine.handle(connect_request(1), t0());
        assert_eq!(
            machine.handle(MachineEvent::PeripheralRetrieved(None), t0()),
            vec![emitted_state(ConnectionState::Scanning), Effect::StartScan]
        );
    }

    #[test]
    fn test_scan_matches_sensor_advertisement() {
        let mut machine =
            ConnectionMachine::new(ConnectionOptions::default(), ConnectionRecord::default());
        machine.handle(MachineEvent::AdapterPowered(true), t0());
        assert_eq!(
            machine.handle(connect_request(1), t0()),
            vec![emitted_state(ConnectionState::Scanning), Effect::StartScan]
        );

        let stranger = Advertisement {
            id: "other".into(),
            name: Some("Thermometer".into()),
            manufacturer_data: HashMap::new(),
        };
        assert!(
            machine
                .handle(MachineEvent::PeripheralDiscovered(stranger), t0())
                .is_empty()
        );

        let sensor = Advertisement {
            id: "p9".into(),
            name: Some("ABBOTT3MH001DG75W".into()),
            manufacturer_data: HashMap::from([(0x0000, uid()[..6].to_vec())]),
        };
        assert_eq!(
            machine.handle(MachineEvent::PeripheralDiscovered(sensor), t0()),
            vec![
                Effect::StopScan,
                Effect::PersistPeripheral(Some("p9".into())),
                emitted_state(ConnectionState::Connecting),
                Effect::Connect("p9".into()),
            ]
        );
        assert_eq!(machine.peripheral_id(), Some("p9"));
    }

    #[test]
    fn test_disconnect_with_stay_connected_reconnects_once() {
        let mut machine = streaming_machine(5);
        let effects = machine.handle(
            MachineEvent::PeripheralDisconnected(Some("link lost".into())),
            t0(),
        );
        assert_eq!(
            effects,
            vec![
                emitted_state(ConnectionState::Disconnected),
                emitted_state(ConnectionState::Connecting),
                Effect::Connect("p1".into()),
            ]
        );
    }

    #[test]
    fn test_failed_attempts_back_off_then_rescan() {
        let mut machine = streaming_machine(1);
        machine.handle(MachineEvent::PeripheralDisconnected(None), t0());

        let mut delays = Vec::new();
        for _ in 0..4 {
            let effects = machine.handle(
                MachineEvent::ConnectFailed(ConnectionFailureReason::OutOfRange),
                t0(),
            );
            assert_eq!(machine.state(), ConnectionState::Disconnected);
            delays.extend(effects.iter().filter_map(|e| match e {
                Effect::ScheduleReconnect(d) => Some(d.as_secs()),
                _ => None,
            }));
            assert_eq!(
                machine.handle(MachineEvent::ReconnectElapsed, t0()),
                vec![
                    emitted_state(ConnectionState::Connecting),
                    Effect::Connect("p1".into()),
                ]
            );
        }
        assert_eq!(delays, vec![1, 2, 4, 8]);

        let effects = machine.handle(
            MachineEvent::ConnectFailed(ConnectionFailureReason::Timeout),
            t0(),
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Emit(DomainEvent::ConnectionErrorRaised { error }) if error.critical
        )));
        assert!(effects.contains(&Effect::PersistPeripheral(None)));
        assert_eq!(effects.last(), Some(&Effect::StartScan));
        assert_eq!(machine.state(), ConnectionState::Scanning);
        assert_eq!(machine.peripheral_id(), None);
        assert_eq!(machine.failures(), 0);
    }

    #[test]
    fn test_disconnect_while_connecting_counts_as_failure() {
        let mut machine = streaming_machine(1);
        machine.handle(MachineEvent::PeripheralDisconnected(None), t0());
        let effects = machine.handle(MachineEvent::PeripheralDisconnected(None), t0());
        assert_eq!(machine.failures(), 1);
        assert!(effects.contains(&Effect::ScheduleReconnect(Duration::from_secs(1))));
    }

    #[test]
    fn test_disconnect_requested_stops_reconnecting() {
        let mut machine = streaming_machine(1);
        assert_eq!(
            machine.handle(MachineEvent::DisconnectRequested, t0()),
            vec![
                Effect::Disconnect,
                emitted_state(ConnectionState::Disconnected)
            ]
        );
        assert!(!machine.stay_connected());
        assert!(
            machine
                .handle(MachineEvent::PeripheralDisconnected(None), t0())
                .is_empty()
        );
        assert!(
            machine
                .handle(MachineEvent::ReconnectElapsed, t0())
                .is_empty()
        );
    }

    #[test]
    fn test_unlock_count_increments_per_connection() {
        let mut machine = streaming_machine(1);
        assert_eq!(machine.unlock_count(), 1);
        machine.handle(MachineEvent::PeripheralDisconnected(None), t0());
        machine.handle(MachineEvent::PeripheralConnected, t0());
        machine.handle(MachineEvent::ServicesDiscovered { found: true }, t0());
        let effects = machine.handle(
            MachineEvent::CharacteristicsDiscovered {
                write: true,
                notify: true,
            },
            t0(),
        );
        assert_eq!(effects[0], Effect::PersistUnlockCount(2));
        assert_eq!(machine.unlock_count(), 2);
    }

    #[test]
    fn test_missing_service_fails_attempt() {
        let mut machine = ConnectionMachine::new(ConnectionOptions::default(), remembered());
        machine.handle(MachineEvent::AdapterPowered(true), t0());
        machine.handle(connect_request(1), t0());
        machine.handle(MachineEvent::PeripheralRetrieved(Some("p1".into())), t0());
        machine.handle(MachineEvent::PeripheralConnected, t0());

        let effects = machine.handle(MachineEvent::ServicesDiscovered { found: false }, t0());
        assert_eq!(effects[0], Effect::Disconnect);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.failures(), 1);
    }

    #[test]
    fn test_adapter_power_off() {
        let mut machine = streaming_machine(1);
        assert_eq!(
            machine.handle(MachineEvent::AdapterPowered(false), t0()),
            vec![emitted_state(ConnectionState::PoweredOff)]
        );
        assert!(
            machine
                .handle(MachineEvent::PeripheralDisconnected(None), t0())
                .is_empty()
        );
    }

    #[test]
    fn test_streaming_frame_emits_state_and_readings() {
        let mut machine = streaming_machine(1);
        let packet = StreamingPacketBuilder::new(uid())
            .age(1000)
            .glucose(1500)
            .build()
            .unwrap();

        let effects = feed_packet(&mut machine, &packet, t0());
        assert!(matches!(
            effects[0],
            Effect::ScheduleBufferReset { generation: 1, .. }
        ));
        assert!(effects.contains(&Effect::Emit(DomainEvent::SensorStateChanged {
            age: 1000,
            state: SensorState::Ready,
        })));

        let readings = effects
            .iter()
            .find_map(|e| match e {
                Effect::Emit(DomainEvent::GlucoseReadingsAdded { readings }) => Some(readings),
                _ => None,
            })
            .unwrap();
        assert_eq!(readings.len(), 10);
        assert!(readings.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(machine.sensor().unwrap().age, 1000);
    }

    #[test]
    fn test_sampling_interval_gates_forwarding() {
        let mut machine = streaming_machine(5);
        let mut forwarded = Vec::new();
        for minute in 0..15u16 {
            let packet = StreamingPacketBuilder::new(uid())
                .age(1000 + minute)
                .glucose(1500)
                .build()
                .unwrap();
            let now = t0() + time::Duration::minutes(i64::from(minute));
            if readings_events(&feed_packet(&mut machine, &packet, now)) > 0 {
                forwarded.push(minute);
            }
        }
        assert_eq!(forwarded, vec![0, 5, 10]);
    }

    #[test]
    fn test_corrupted_frame_is_dropped() {
        let mut machine = streaming_machine(1);
        let mut packet = StreamingPacketBuilder::new(uid())
            .age(1000)
            .glucose(1500)
            .build()
            .unwrap();
        packet[10] ^= 0xFF;

        let effects = feed_packet(&mut machine, &packet, t0());
        assert!(
            !effects
                .iter()
                .any(|e| matches!(e, Effect::Emit(_)))
        );
        assert_eq!(machine.state(), ConnectionState::Streaming);
    }

    #[test]
    fn test_warming_sensor_holds_readings() {
        let mut machine = streaming_machine(1);
        let packet = StreamingPacketBuilder::new(uid())
            .age(30)
            .glucose(1500)
            .build()
            .unwrap();

        let effects = feed_packet(&mut machine, &packet, t0());
        assert!(effects.contains(&Effect::Emit(DomainEvent::SensorStateChanged {
            age: 30,
            state: SensorState::Starting,
        })));
        assert_eq!(readings_events(&effects), 0);
    }

    #[test]
    fn test_stale_partial_frame_expires() {
        let mut machine = streaming_machine(1);
        let packet = StreamingPacketBuilder::new(uid())
            .age(1000)
            .glucose(1500)
            .build()
            .unwrap();

        machine.handle(MachineEvent::Notification(packet[..20].to_vec()), t0());
        machine.handle(MachineEvent::BufferResetElapsed { generation: 1 }, t0());
        let effects = machine.handle(MachineEvent::Notification(packet[20..38].to_vec()), t0());
        assert!(effects.is_empty());
        let effects = machine.handle(MachineEvent::Notification(packet[38..].to_vec()), t0());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_connect_request_for_new_sensor_drops_old_link() {
        let mut machine = streaming_machine(1);
        let mut other = sample_sensor(t0());
        other.identity = cgm_types::SensorIdentity::new(
            [0x11, 0x22, 0x33, 0x00, 0x00, 0xA4, 0x07, 0xE0],
            other.identity.patch_info,
        );

        let effects = machine.handle(
            MachineEvent::ConnectRequested {
                sensor: Box::new(other),
                sampling_interval_minutes: 1,
            },
            t0(),
        );
        assert_eq!(
            effects,
            vec![
                Effect::Disconnect,
                emitted_state(ConnectionState::Disconnected),
                emitted_state(ConnectionState::Scanning),
                Effect::StartScan,
            ]
        );
        assert_eq!(machine.peripheral_id(), None);
        assert_eq!(machine.unlock_count(), 0);
    }

    #[test]
    fn test_options_validate() {
        assert!(ConnectionOptions::default().validate().is_ok());
        let options = ConnectionOptions {
            buffer_reset_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
