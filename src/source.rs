use log::{debug, info};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_modbus::client::sync::{self, Reader, Writer};
use tokio_modbus::prelude::{Slave, SlaveContext};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("device answered with exception: {0}")]
    Exception(String),
    #[error("transport not connected")]
    NotConnected,
}

impl RegisterError {
    /// True when the link itself is broken and must be reopened. A timeout
    /// only says one unit did not answer; the other units on the bus may
    /// still be fine, so it leaves the link alone like an exception does.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, RegisterError::Transport(_) | RegisterError::NotConnected)
    }

    fn from_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            RegisterError::Timeout
        } else {
            RegisterError::Transport(err.to_string())
        }
    }
}

impl From<tokio_modbus::Error> for RegisterError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(e) => RegisterError::from_io(e),
            other => RegisterError::Transport(other.to_string()),
        }
    }
}

/// Holding-register access to the devices behind one physical transport.
/// At most one request is in flight at a time: callers share a source
/// behind a mutex.
pub trait RegisterSource: Send {
    /// Open the transport if it is not open yet.
    fn connect(&mut self) -> Result<(), RegisterError>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, RegisterError>;

    fn write_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), RegisterError>;
}

/// Where a Modbus link goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Rtu { path: String, baud_rate: u32 },
    Tcp { addr: SocketAddr },
}

impl fmt::Display for LinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkTarget::Rtu { path, baud_rate } => write!(f, "RTU {} @ {} baud", path, baud_rate),
            LinkTarget::Tcp { addr } => write!(f, "TCP {}", addr),
        }
    }
}

/// Modbus RTU/TCP link backed by the blocking tokio-modbus client.
pub struct ModbusLink {
    target: LinkTarget,
    timeout: Duration,
    ctx: Option<sync::Context>,
}

impl ModbusLink {
    pub fn new(target: LinkTarget, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            ctx: None,
        }
    }

    fn open(&self) -> io::Result<sync::Context> {
        match &self.target {
            LinkTarget::Rtu { path, baud_rate } => {
                // 8N1, matching the meters' factory serial settings
                let builder = tokio_serial::new(path, *baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .timeout(self.timeout);
                sync::rtu::connect_slave_with_timeout(&builder, Slave(1), Some(self.timeout))
            }
            LinkTarget::Tcp { addr } => {
                sync::tcp::connect_slave_with_timeout(*addr, Slave(1), Some(self.timeout))
            }
        }
    }

    fn context(&mut self, unit: u8) -> Result<&mut sync::Context, RegisterError> {
        let ctx = self.ctx.as_mut().ok_or(RegisterError::NotConnected)?;
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }

    /// Drop the context after a link fault so the next `connect` reopens
    /// the port.
    fn check<T>(&mut self, result: Result<T, RegisterError>) -> Result<T, RegisterError> {
        if let Err(e) = &result {
            if e.is_link_fault() {
                debug!("Dropping {} after error: {}", self.target, e);
                self.ctx = None;
            }
        }
        result
    }
}

fn flatten<T>(result: tokio_modbus::Result<T>) -> Result<T, RegisterError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(code)) => Err(RegisterError::Exception(format!("{:?}", code))),
        Err(e) => Err(e.into()),
    }
}

impl RegisterSource for ModbusLink {
    fn connect(&mut self) -> Result<(), RegisterError> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let ctx = self.open().map_err(RegisterError::from_io)?;
        info!("Opened Modbus link {}", self.target);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.ctx.take().is_some() {
            info!("Closed Modbus link {}", self.target);
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, RegisterError> {
        let result = self
            .context(unit)
            .and_then(|ctx| flatten(ctx.read_holding_registers(address, count)));
        self.check(result)
    }

    fn write_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), RegisterError> {
        let result = self
            .context(unit)
            .and_then(|ctx| flatten(ctx.write_multiple_registers(address, values)));
        self.check(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_break_the_link() {
        assert!(!RegisterError::Exception("Illegal data address".into()).is_link_fault());
        assert!(!RegisterError::Timeout.is_link_fault());
        assert!(RegisterError::NotConnected.is_link_fault());
        assert!(RegisterError::Transport("broken pipe".into()).is_link_fault());
    }

    #[test]
    fn timed_out_io_maps_to_timeout() {
        let err = RegisterError::from_io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(err, RegisterError::Timeout));
        let err = RegisterError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, RegisterError::Transport(_)));
    }

    #[test]
    fn unopened_link_reports_not_connected() {
        let mut link = ModbusLink::new(
            LinkTarget::Tcp {
                addr: "127.0.0.1:502".parse().unwrap(),
            },
            Duration::from_millis(300),
        );
        assert!(!link.is_connected());
        let err = link.read_holding_registers(1, 0x1000, 14).unwrap_err();
        assert!(matches!(err, RegisterError::NotConnected));
    }

    #[test]
    fn link_target_display() {
        let t = LinkTarget::Rtu {
            path: "/dev/ttyHS0".into(),
            baud_rate: 19200,
        };
        assert_eq!(t.to_string(), "RTU /dev/ttyHS0 @ 19200 baud");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::decode::RegisterBlocks;
    use std::collections::{HashMap, HashSet};

    /// In-memory register source. Reads must start at a stored block's
    /// address; anything else answers with an exception, like a meter asked
    /// for a register it does not map.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub blocks: HashMap<(u8, u16), Vec<u16>>,
        pub connected: bool,
        /// Upcoming connect attempts that fail.
        pub refuse_connects: u32,
        /// Upcoming reads that fail at the transport and drop the link.
        pub fail_reads: u32,
        /// Upcoming reads that time out; the link stays open.
        pub timeout_reads: u32,
        /// Units that never answer.
        pub silent_units: HashSet<u8>,
        pub connects: u32,
        pub reads: u32,
        pub writes: Vec<(u8, u16, Vec<u16>)>,
    }

    impl FakeSource {
        pub(crate) fn with_blocks(unit: u8, blocks: &RegisterBlocks) -> Self {
            let mut source = Self::default();
            source.add_unit(unit, blocks);
            source
        }

        pub(crate) fn add_unit(&mut self, unit: u8, blocks: &RegisterBlocks) {
            for (address, regs) in blocks.iter() {
                self.blocks.insert((unit, address), regs.to_vec());
            }
        }
    }

    impl RegisterSource for FakeSource {
        fn connect(&mut self) -> Result<(), RegisterError> {
            if self.connected {
                return Ok(());
            }
            if self.refuse_connects > 0 {
                self.refuse_connects -= 1;
                return Err(RegisterError::Transport("port busy".into()));
            }
            self.connects += 1;
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn read_holding_registers(
            &mut self,
            unit: u8,
            address: u16,
            count: u16,
        ) -> Result<Vec<u16>, RegisterError> {
            if !self.connected {
                return Err(RegisterError::NotConnected);
            }
            self.reads += 1;
            if self.fail_reads > 0 {
                self.fail_reads -= 1;
                self.connected = false;
                return Err(RegisterError::Transport("broken pipe".into()));
            }
            if self.timeout_reads > 0 {
                self.timeout_reads -= 1;
                return Err(RegisterError::Timeout);
            }
            if self.silent_units.contains(&unit) {
                return Err(RegisterError::Timeout);
            }
            match self.blocks.get(&(unit, address)) {
                Some(regs) if regs.len() >= count as usize => Ok(regs[..count as usize].to_vec()),
                _ => Err(RegisterError::Exception("IllegalDataAddress".into())),
            }
        }

        fn write_holding_registers(
            &mut self,
            unit: u8,
            address: u16,
            values: &[u16],
        ) -> Result<(), RegisterError> {
            if !self.connected {
                return Err(RegisterError::NotConnected);
            }
            self.writes.push((unit, address, values.to_vec()));
            Ok(())
        }
    }
}
