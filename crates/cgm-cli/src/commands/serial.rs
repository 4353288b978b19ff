//! Serial command implementation.

use std::path::PathBuf;

use anyhow::Result;
use cgm_types::SensorIdentity;

use crate::cli::SensorArgs;
use crate::config::Config;
use crate::util::{resolve_identity, write_output};

pub fn cmd_serial(sensor: &SensorArgs, config: &Config, output: Option<&PathBuf>) -> Result<()> {
    let identity = resolve_identity(sensor, config)?;
    write_output(output, &format_identity(&identity))
}

fn format_identity(identity: &SensorIdentity) -> String {
    format!(
        "Serial:  {}\nFamily:  {}\nType:    {}\nRegion:  {:?}\n",
        identity.serial,
        identity.family(),
        identity.sensor_type(),
        identity.region()
    )
}
