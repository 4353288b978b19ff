//! Adapter access and peripheral lookup.

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tracing::debug;

use super::profile::Advertisement;
use crate::error::{ConnectionFailureReason, Error, Result};

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::connection_failed(
        None,
        ConnectionFailureReason::AdapterUnavailable,
    ))
}

/// Format a peripheral ID as a string.
///
/// Strips the `PeripheralId(...)` wrapper of the debug output so the value
/// can be stored and compared across runs.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Build an [`Advertisement`] from a peripheral's cached properties.
pub fn advertisement_from(id: &PeripheralId, properties: PeripheralProperties) -> Advertisement {
    Advertisement {
        id: format_peripheral_id(id),
        name: properties.local_name,
        manufacturer_data: properties.manufacturer_data,
    }
}

/// Read the advertisement of a peripheral known to the adapter.
pub async fn advertisement_of(peripheral: &Peripheral) -> Result<Option<Advertisement>> {
    Ok(peripheral
        .properties()
        .await?
        .map(|properties| advertisement_from(&peripheral.id(), properties)))
}

/// Find a peripheral the adapter already knows, by stored identifier.
///
/// The identifier is compared against the formatted peripheral ID (a UUID
/// on macOS) and, where one is exposed, the MAC address.
pub async fn find_known_peripheral(adapter: &Adapter, identifier: &str) -> Result<Option<Peripheral>> {
    let wanted = identifier.to_lowercase();
    for peripheral in adapter.peripherals().await? {
        if format_peripheral_id(&peripheral.id()).to_lowercase() == wanted {
            debug!("Matched peripheral by id: {}", identifier);
            return Ok(Some(peripheral));
        }
        if let Ok(Some(props)) = peripheral.properties().await {
            let address = props.address.to_string().to_lowercase();
            if address != "00:00:00:00:00:00" && address == wanted {
                debug!("Matched peripheral by address: {}", address);
                return Ok(Some(peripheral));
            }
        }
    }
    Ok(None)
}
