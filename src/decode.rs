//! Register maps per meter family and their decoders.

use log::debug;
use thiserror::Error;

use crate::meter::{DeviceFamily, Reading};
use crate::source::{RegisterError, RegisterSource};

/// One contiguous run of holding registers read in a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDef {
    pub name: &'static str,
    pub address: u16,
    pub count: u16,
    /// A Modbus exception on an optional block leaves it out instead of
    /// failing the sample.
    pub optional: bool,
}

const fn block(name: &'static str, address: u16, count: u16) -> BlockDef {
    BlockDef {
        name,
        address,
        count,
        optional: false,
    }
}

// Fixed-point family
const FIXED_SERIAL: BlockDef = block("serial", 0x2213, 1);
const FIXED_VOLTAGE_CURRENT: BlockDef = block("voltage/current", 0x1000, 14);
const FIXED_POWER: BlockDef = block("power", 0x1014, 10);
const FIXED_CONSUMED: BlockDef = block("consumed energy", 0x101C, 2);
const FIXED_DELIVERED: BlockDef = block("delivered energy", 0x1020, 2);
const FIXED_POWER_FACTOR: BlockDef = block("power factor", 0x1024, 2);
const FIXED_FREQUENCY: BlockDef = block("frequency", 0x1026, 1);
const FIXED_CT_RATIO: BlockDef = block("ct ratio", 0x1200, 1);
const FIXED_HOURS: BlockDef = BlockDef {
    optional: true,
    ..block("operating hours", 0x106E, 1)
};

/// Register answered by every fixed-point meter (its serial number).
pub const FIXED_PROBE_ADDRESS: u16 = FIXED_SERIAL.address;

pub const FIXED_MAP: [BlockDef; 9] = [
    FIXED_SERIAL,
    FIXED_VOLTAGE_CURRENT,
    FIXED_POWER,
    FIXED_CONSUMED,
    FIXED_DELIVERED,
    FIXED_POWER_FACTOR,
    FIXED_FREQUENCY,
    FIXED_CT_RATIO,
    FIXED_HOURS,
];

// Floating-point family
const FLOAT_MEASUREMENTS: BlockDef = block("measurements", 0x0000, 28);
const FLOAT_IDENTITY: BlockDef = block("identity", 0x0100, 4);

/// Register answered by every floating-point meter (its identity block).
pub const FLOAT_PROBE_ADDRESS: u16 = FLOAT_IDENTITY.address;

pub const FLOAT_MAP: [BlockDef; 2] = [FLOAT_MEASUREMENTS, FLOAT_IDENTITY];

pub fn register_map(family: DeviceFamily) -> &'static [BlockDef] {
    match family {
        DeviceFamily::Fixed => &FIXED_MAP,
        DeviceFamily::Float => &FLOAT_MAP,
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("register block {name} at {address:#06x} is missing")]
    MissingBlock { name: &'static str, address: u16 },
    #[error("register block {name}: expected {expected} registers, got {actual}")]
    BlockLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("field {field} decoded to a non-finite value")]
    NonFinite { field: &'static str },
}

/// Raw register blocks of one sample, keyed by start address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterBlocks {
    blocks: Vec<(u16, Vec<u16>)>,
}

impl RegisterBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u16, registers: Vec<u16>) {
        match self.blocks.iter_mut().find(|(a, _)| *a == address) {
            Some(entry) => entry.1 = registers,
            None => self.blocks.push((address, registers)),
        }
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u16])> {
        self.blocks.iter().map(|(a, r)| (*a, r.as_slice()))
    }

    fn lookup(&self, block: &BlockDef) -> Option<&[u16]> {
        self.blocks
            .iter()
            .find(|(a, _)| *a == block.address)
            .map(|(_, r)| r.as_slice())
    }

    /// The registers read for `block`, checked against its expected length.
    fn require(&self, block: &BlockDef) -> Result<&[u16], DecodeError> {
        self.optional(block)?.ok_or(DecodeError::MissingBlock {
            name: block.name,
            address: block.address,
        })
    }

    fn optional(&self, block: &BlockDef) -> Result<Option<&[u16]>, DecodeError> {
        match self.lookup(block) {
            Some(regs) if regs.len() != block.count as usize => Err(DecodeError::BlockLength {
                name: block.name,
                expected: block.count as usize,
                actual: regs.len(),
            }),
            other => Ok(other),
        }
    }
}

/// Read every block of `family`'s register map from `unit`.
///
/// Any transport failure or timeout aborts the whole read. A Modbus
/// exception aborts it too, unless the block is optional.
pub fn read_blocks<S: RegisterSource + ?Sized>(
    source: &mut S,
    unit: u8,
    family: DeviceFamily,
) -> Result<RegisterBlocks, RegisterError> {
    let mut blocks = RegisterBlocks::new();
    for block in register_map(family) {
        match source.read_holding_registers(unit, block.address, block.count) {
            Ok(regs) => blocks.insert(block.address, regs),
            Err(e @ RegisterError::Exception(_)) if block.optional => {
                debug!("Unit {}: optional block {} unavailable: {}", unit, block.name, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(blocks)
}

/// Decode a sample's register blocks for the given family.
pub fn decode(blocks: &RegisterBlocks, family: DeviceFamily) -> Result<Reading, DecodeError> {
    let reading = match family {
        DeviceFamily::Fixed => decode_fixed(blocks)?,
        DeviceFamily::Float => decode_float(blocks)?,
    };
    for (field, value) in reading.float_fields() {
        if !value.is_finite() {
            return Err(DecodeError::NonFinite { field });
        }
    }
    Ok(reading)
}

fn pair(regs: &[u16], index: usize) -> u32 {
    (regs[index] as u32) << 16 | regs[index + 1] as u32
}

fn milli(regs: &[u16], index: usize) -> f64 {
    pair(regs, index) as f64 / 1000.0
}

fn centi(regs: &[u16], index: usize) -> f64 {
    pair(regs, index) as f64 / 100.0
}

/// Big-endian word order: the first register holds the high half of the
/// float's bit pattern.
fn float(regs: &[u16], index: usize) -> f64 {
    f32::from_bits(pair(regs, index)) as f64
}

/// Energy counters of the fixed-point meter count in a unit that depends
/// on the configured CT ratio.
pub fn scale_energy_by_ct_ratio(value: f64, ct_ratio: u32) -> f64 {
    if ct_ratio >= 100_000 {
        value * 1000.0
    } else if ct_ratio >= 10_000 {
        value * 100.0
    } else if ct_ratio >= 1_000 {
        value * 10.0
    } else if ct_ratio >= 100 {
        value
    } else if ct_ratio >= 10 {
        value / 10.0
    } else if ct_ratio >= 1 {
        value / 100.0
    } else {
        value / 1000.0
    }
}

/// Frequency is reported within [0, 100] Hz. A NaN is passed through so the
/// finiteness check rejects the sample.
pub fn clamp_frequency(hz: f64) -> f64 {
    if hz.is_nan() {
        hz
    } else {
        hz.clamp(0.0, 100.0)
    }
}

fn decode_fixed(blocks: &RegisterBlocks) -> Result<Reading, DecodeError> {
    let serial = blocks.require(&FIXED_SERIAL)?;
    let vi = blocks.require(&FIXED_VOLTAGE_CURRENT)?;
    let power = blocks.require(&FIXED_POWER)?;
    let consumed = blocks.require(&FIXED_CONSUMED)?;
    let delivered = blocks.require(&FIXED_DELIVERED)?;
    let pf = blocks.require(&FIXED_POWER_FACTOR)?;
    let frequency = blocks.require(&FIXED_FREQUENCY)?;
    let ct = blocks.require(&FIXED_CT_RATIO)?;
    let hours = blocks.optional(&FIXED_HOURS)?;

    let ct_ratio = ct[0];
    // Firmware quirk: power registers are a hundredfold too large below CT 5000
    let power_scale = if ct_ratio < 5000 { 0.01 } else { 1.0 };

    Ok(Reading {
        device_serial: serial[0] as u32,
        voltage_l1: milli(vi, 0),
        voltage_l2: milli(vi, 2),
        voltage_l3: milli(vi, 4),
        current_l1: milli(vi, 6),
        current_l2: milli(vi, 8),
        current_l3: milli(vi, 10),
        current_n: milli(vi, 12),
        active_power: centi(power, 0) * power_scale,
        reactive_power: centi(power, 2) * power_scale,
        apparent_power: centi(power, 4) * power_scale,
        sign_active: power[6],
        sign_reactive: power[7],
        chained_voltage_l1l2: milli(power, 8),
        frequency: clamp_frequency(frequency[0] as f64 / 10.0),
        consumed_energy: scale_energy_by_ct_ratio(milli(consumed, 0), ct_ratio as u32),
        delivered_energy: scale_energy_by_ct_ratio(milli(delivered, 0), ct_ratio as u32),
        power_factor: pf[0] as f64 / 1000.0,
        sector_power_factor: pf[1],
        ct_ratio,
        operating_hours: hours.map(|h| h[0]).unwrap_or(0),
    })
}

fn decode_float(blocks: &RegisterBlocks) -> Result<Reading, DecodeError> {
    let m = blocks.require(&FLOAT_MEASUREMENTS)?;
    let id = blocks.require(&FLOAT_IDENTITY)?;

    Ok(Reading {
        device_serial: pair(id, 0),
        voltage_l1: float(m, 0),
        voltage_l2: float(m, 2),
        voltage_l3: float(m, 4),
        current_l1: float(m, 6),
        current_l2: float(m, 8),
        current_l3: float(m, 10),
        current_n: float(m, 12),
        active_power: float(m, 14),
        reactive_power: float(m, 16),
        apparent_power: float(m, 18),
        power_factor: float(m, 20),
        frequency: clamp_frequency(float(m, 22)),
        consumed_energy: float(m, 24),
        delivered_energy: float(m, 26),
        // not exposed by this family
        sector_power_factor: 0,
        sign_active: 0,
        sign_reactive: 0,
        chained_voltage_l1l2: 0.0,
        ct_ratio: id[2],
        operating_hours: id[3],
    })
}
