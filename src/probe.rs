use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::time::Duration;

use crate::decode::{FIXED_PROBE_ADDRESS, FLOAT_PROBE_ADDRESS};
use crate::meter::DeviceFamily;
use crate::source::{LinkTarget, ModbusLink, RegisterError, RegisterSource};

const PROBES: [(DeviceFamily, u16); 2] = [
    (DeviceFamily::Fixed, FIXED_PROBE_ADDRESS),
    (DeviceFamily::Float, FLOAT_PROBE_ADDRESS),
];

/// Find out which register map `unit` speaks by reading each family's probe
/// register in turn over an open link. A family whose probe times out or
/// answers with an exception is skipped; `None` means no family answered.
pub fn detect_family<S: RegisterSource + ?Sized>(
    source: &mut S,
    unit: u8,
) -> Result<Option<DeviceFamily>, RegisterError> {
    for (family, address) in PROBES {
        match source.read_holding_registers(unit, address, 1) {
            Ok(_) => {
                info!("Unit {} answers as a {} meter", unit, family);
                return Ok(Some(family));
            }
            Err(e @ (RegisterError::Exception(_) | RegisterError::Timeout)) => {
                debug!("Unit {} is not a {} meter: {}", unit, family, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Probe a single serial port for a meter at `unit`.
fn probe_port(path: &str, baud_rate: u32, unit: u8, timeout: Duration) -> Result<bool> {
    debug!("Probing port {}", path);
    let mut link = ModbusLink::new(
        LinkTarget::Rtu {
            path: path.to_string(),
            baud_rate,
        },
        timeout,
    );
    link.connect()
        .with_context(|| format!("Failed to open serial port {}", path))?;
    let found = detect_family(&mut link, unit)?.is_some();
    link.disconnect();
    Ok(found)
}

/// Enumerate available serial ports, probe each ttyUSB port, and return the
/// path of the first one with a meter answering at `unit`.
pub fn find_meter_port(baud_rate: u32, unit: u8, timeout: Duration) -> Result<String> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

    let usb_ports: Vec<_> = ports
        .iter()
        .filter(|p| p.port_name.contains("ttyUSB"))
        .collect();

    if usb_ports.is_empty() {
        bail!("No /dev/ttyUSB* ports found");
    }

    info!(
        "Found {} USB serial port(s), probing for unit {}",
        usb_ports.len(),
        unit
    );

    for port_info in &usb_ports {
        match probe_port(&port_info.port_name, baud_rate, unit, timeout) {
            Ok(true) => {
                info!("Found meter on port {}", port_info.port_name);
                return Ok(port_info.port_name.clone());
            }
            Ok(false) => continue,
            Err(e) => {
                warn!("Error probing {}: {}", port_info.port_name, e);
                continue;
            }
        }
    }

    bail!(
        "No meter at unit {} on any of the {} USB serial port(s)",
        unit,
        usb_ports.len()
    )
}
