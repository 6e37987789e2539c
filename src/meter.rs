use std::fmt;

/// Register map / numeric encoding spoken by a meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Compact three-phase meter, fixed-point u32 register pairs.
    Fixed,
    /// Higher-resolution meter, IEEE-754 f32 register pairs.
    Float,
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Fixed => write!(f, "fixed-point"),
            DeviceFamily::Float => write!(f, "floating-point"),
        }
    }
}

/// One instant's decoded measurement set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub device_serial: u32,
    /// Phase voltages (V)
    pub voltage_l1: f64,
    pub voltage_l2: f64,
    pub voltage_l3: f64,
    /// Phase currents (A)
    pub current_l1: f64,
    pub current_l2: f64,
    pub current_l3: f64,
    /// Neutral current (A)
    pub current_n: f64,
    /// Three-phase active power (W)
    pub active_power: f64,
    /// Three-phase reactive power (VAR)
    pub reactive_power: f64,
    /// Three-phase apparent power (VA)
    pub apparent_power: f64,
    /// Grid frequency (Hz), always within [0, 100]
    pub frequency: f64,
    /// Energy counters after CT-ratio banding
    pub consumed_energy: f64,
    pub delivered_energy: f64,
    pub power_factor: f64,
    pub sector_power_factor: u16,
    pub sign_active: u16,
    pub sign_reactive: u16,
    /// Chained L1-L2 voltage (V), 0 when the family has no such register
    pub chained_voltage_l1l2: f64,
    pub ct_ratio: u16,
    pub operating_hours: u16,
}

/// The six aggregated electrical channels, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    VoltageL1,
    VoltageL2,
    VoltageL3,
    CurrentL1,
    CurrentL2,
    CurrentL3,
}

impl Channel {
    pub const ALL: [Channel; 6] = [
        Channel::VoltageL1,
        Channel::VoltageL2,
        Channel::VoltageL3,
        Channel::CurrentL1,
        Channel::CurrentL2,
        Channel::CurrentL3,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl Reading {
    pub fn channel(&self, channel: Channel) -> f64 {
        match channel {
            Channel::VoltageL1 => self.voltage_l1,
            Channel::VoltageL2 => self.voltage_l2,
            Channel::VoltageL3 => self.voltage_l3,
            Channel::CurrentL1 => self.current_l1,
            Channel::CurrentL2 => self.current_l2,
            Channel::CurrentL3 => self.current_l3,
        }
    }

    /// Name and value of every floating-point field, used for the
    /// finiteness checks on both sides of the pipeline.
    pub fn float_fields(&self) -> [(&'static str, f64); 15] {
        [
            ("voltage_l1", self.voltage_l1),
            ("voltage_l2", self.voltage_l2),
            ("voltage_l3", self.voltage_l3),
            ("current_l1", self.current_l1),
            ("current_l2", self.current_l2),
            ("current_l3", self.current_l3),
            ("current_n", self.current_n),
            ("active_power", self.active_power),
            ("reactive_power", self.reactive_power),
            ("apparent_power", self.apparent_power),
            ("frequency", self.frequency),
            ("consumed_energy", self.consumed_energy),
            ("delivered_energy", self.delivered_energy),
            ("power_factor", self.power_factor),
            ("chained_voltage_l1l2", self.chained_voltage_l1l2),
        ]
    }
}
