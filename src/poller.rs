//! Per-device polling loop: a sampling thread and a publishing thread per
//! unit, sharing only the aggregation window.

use log::{debug, info, warn};
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::aggregate::Aggregator;
use crate::decode::{self, DecodeError};
use crate::frame::{self, EncodeError};
use crate::meter::{DeviceFamily, Reading};
use crate::mqtt::{LogChannel, PublishError, Publisher, ResetKind};
use crate::probe;
use crate::source::{RegisterError, RegisterSource};

/// Longest uninterrupted sleep, so a stop request is seen promptly.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Master unlock key and command register of the fixed-point meter.
const UNLOCK_REGISTER: u16 = 0x2700;
const UNLOCK_KEY: u16 = 0x5AA5;
const COMMAND_REGISTER: u16 = 0x2400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Disconnected,
    Connecting,
    Sampling,
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no known meter answers at unit {0}")]
    Undetected(u8),
}

impl SampleError {
    /// Only a broken link sends the loop back to `Connecting`; bad data
    /// just drops the sample.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, SampleError::Register(e) if e.is_link_fault())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SampleError::Register(RegisterError::Timeout))
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("min/max reset is not supported by {0} meters")]
    Unsupported(DeviceFamily),
    #[error("meter family of unit {0} is not known yet")]
    Undetected(u8),
    #[error(transparent)]
    Register(#[from] RegisterError),
}

#[derive(Debug)]
pub enum PublishOutcome {
    Published,
    /// Nothing sampled yet; the window is left alone.
    NoReading,
    /// Frame could not be built; the snapshot went back into the window.
    EncodeFailed(EncodeError),
    /// Frame dropped; the window it carried is gone.
    PublishFailed(PublishError),
}

/// Publish period shared by every loop, adjustable at runtime.
#[derive(Debug, Clone)]
pub struct SharedInterval(Arc<AtomicU64>);

impl SharedInterval {
    pub fn new(period: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(period.as_millis() as u64)))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, period: Duration) {
        self.0.store(period.as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub sample_interval: Duration,
    pub publish_interval: SharedInterval,
    pub reconnect_delay: Duration,
    pub data_topic: String,
}

/// Sleep until `deadline`. Returns false as soon as `running` is cleared.
fn sleep_until(deadline: Instant, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

pub fn pause(duration: Duration, running: &AtomicBool) -> bool {
    sleep_until(Instant::now() + duration, running)
}

/// Fixed-rate schedule. Ticks missed while the caller was busy are skipped
/// rather than replayed.
#[derive(Debug)]
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn set_period(&mut self, period: Duration) {
        if period != self.period {
            self.period = period;
            self.next = Instant::now() + period;
        }
    }

    pub fn wait(&mut self, running: &AtomicBool) -> bool {
        let ticked = sleep_until(self.next, running);
        let now = Instant::now();
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
        ticked
    }
}

pub struct Poller<S: RegisterSource> {
    unit: u8,
    source: Arc<Mutex<S>>,
    forced_family: Option<DeviceFamily>,
    family: Mutex<Option<DeviceFamily>>,
    aggregator: Aggregator,
    latest: Mutex<Option<Reading>>,
    state: Mutex<LoopState>,
    last_sample_ok: AtomicBool,
    publisher: Arc<dyn Publisher>,
    log: Arc<LogChannel>,
    settings: PollSettings,
    running: Arc<AtomicBool>,
}

impl<S: RegisterSource + 'static> Poller<S> {
    pub fn new(
        unit: u8,
        source: Arc<Mutex<S>>,
        forced_family: Option<DeviceFamily>,
        publisher: Arc<dyn Publisher>,
        log: Arc<LogChannel>,
        settings: PollSettings,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            unit,
            source,
            forced_family,
            family: Mutex::new(forced_family),
            aggregator: Aggregator::new(),
            latest: Mutex::new(None),
            state: Mutex::new(LoopState::Disconnected),
            last_sample_ok: AtomicBool::new(false),
            publisher,
            log,
            settings,
            running,
        }
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    pub fn family(&self) -> Option<DeviceFamily> {
        *self.family.lock()
    }

    pub fn is_online(&self) -> bool {
        self.state() == LoopState::Sampling && self.last_sample_ok.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LoopState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Unit {}: {:?} -> {:?}", self.unit, *current, state);
            *current = state;
        }
    }

    /// One connection attempt. Returns true once the loop may sample.
    pub fn connect_step(&self) -> bool {
        self.set_state(LoopState::Connecting);
        match self.source.lock().connect() {
            Ok(()) => {
                self.set_state(LoopState::Sampling);
                self.log.log(format!("Logger {} connected", self.unit));
                true
            }
            Err(e) => {
                self.log
                    .log(format!("Modbus initialisation failed for logger {}: {}", self.unit, e));
                false
            }
        }
    }

    /// Read, decode and accumulate one sample. The transport stays locked
    /// from family detection through the last block read.
    pub fn sample(&self) -> Result<Reading, SampleError> {
        let (blocks, family) = {
            let mut source = self.source.lock();
            let family = match self.family() {
                Some(family) => family,
                None => {
                    let detected = probe::detect_family(&mut *source, self.unit)?
                        .ok_or(SampleError::Undetected(self.unit))?;
                    *self.family.lock() = Some(detected);
                    detected
                }
            };
            (decode::read_blocks(&mut *source, self.unit, family)?, family)
        };
        let reading = decode::decode(&blocks, family)?;
        self.aggregator.accumulate(&reading);
        *self.latest.lock() = Some(reading.clone());
        Ok(reading)
    }

    /// Take one sample and apply the outcome to the loop state.
    pub fn sample_step(&self) {
        match self.sample() {
            Ok(reading) => {
                self.last_sample_ok.store(true, Ordering::SeqCst);
                debug!(
                    "Unit {}: {:.1} V / {:.2} A",
                    self.unit, reading.voltage_l1, reading.current_l1
                );
            }
            Err(e) if e.is_link_fault() => {
                self.last_sample_ok.store(false, Ordering::SeqCst);
                *self.latest.lock() = None;
                self.source.lock().disconnect();
                if self.forced_family.is_none() {
                    // the meter may be swapped while the link is down
                    *self.family.lock() = None;
                }
                self.set_state(LoopState::Connecting);
                self.log
                    .log(format!("Logger {} disconnected: {}", self.unit, e));
            }
            Err(e) if e.is_timeout() => {
                // other units may share the link, only this one goes offline
                *self.latest.lock() = None;
                if self.last_sample_ok.swap(false, Ordering::SeqCst) {
                    self.log
                        .log(format!("Logger {} not responding: {}", self.unit, e));
                } else {
                    debug!("Unit {}: still not responding", self.unit);
                }
            }
            Err(e) => {
                self.last_sample_ok.store(false, Ordering::SeqCst);
                warn!("Unit {}: sample skipped: {}", self.unit, e);
            }
        }
    }

    /// Snapshot the window and publish it with the latest reading. While the
    /// unit is offline there is no latest reading and the window is kept
    /// for the next tick after it recovers.
    pub fn publish_tick(&self, timestamp: u32) -> PublishOutcome {
        let Some(reading) = self.latest.lock().clone() else {
            debug!("Unit {}: nothing sampled yet, skipping publish", self.unit);
            return PublishOutcome::NoReading;
        };

        let snapshot = self.aggregator.snapshot_and_reset();
        let frame = match frame::encode(&reading, &snapshot, timestamp) {
            Ok(frame) => frame,
            Err(e) => {
                self.aggregator.restore(&snapshot);
                self.log
                    .log(format!("Failed to encode frame for logger {}: {}", self.unit, e));
                return PublishOutcome::EncodeFailed(e);
            }
        };

        match self
            .publisher
            .publish(&self.settings.data_topic, frame, QoS::AtLeastOnce)
        {
            Ok(()) => {
                info!(
                    "Published data for logger {} ({} samples) to {}",
                    self.unit,
                    snapshot.count(),
                    self.settings.data_topic
                );
                PublishOutcome::Published
            }
            Err(e) => {
                self.log
                    .log(format!("Failed to publish data for logger {}: {}", self.unit, e));
                PublishOutcome::PublishFailed(e)
            }
        }
    }

    /// Clear the meter's own min/max registers for voltage or current.
    pub fn reset_min_max(&self, kind: ResetKind) -> Result<(), AdminError> {
        match self.family() {
            Some(DeviceFamily::Fixed) => {}
            Some(other) => return Err(AdminError::Unsupported(other)),
            None => return Err(AdminError::Undetected(self.unit)),
        }
        let mut source = self.source.lock();
        source.connect()?;
        source.write_holding_registers(self.unit, UNLOCK_REGISTER, &[UNLOCK_KEY])?;
        source.write_holding_registers(self.unit, COMMAND_REGISTER, &[kind.command_word()])?;
        Ok(())
    }

    fn run_sampling(&self) {
        let mut ticker = Ticker::new(self.settings.sample_interval);
        while self.running.load(Ordering::SeqCst) {
            match self.state() {
                LoopState::Disconnected => self.set_state(LoopState::Connecting),
                LoopState::Connecting => {
                    if !self.connect_step() {
                        pause(self.settings.reconnect_delay, &self.running);
                    }
                }
                LoopState::Sampling => {
                    if ticker.wait(&self.running) {
                        self.sample_step();
                    }
                }
            }
        }
        debug!("Unit {}: sampling stopped", self.unit);
    }

    fn run_publishing(&self) {
        let mut ticker = Ticker::new(self.settings.publish_interval.get());
        while ticker.wait(&self.running) {
            let timestamp = chrono::Utc::now().timestamp() as u32;
            match self.publish_tick(timestamp) {
                PublishOutcome::EncodeFailed(e) => {
                    debug!("Unit {}: window kept for next tick ({})", self.unit, e)
                }
                PublishOutcome::PublishFailed(e) => {
                    debug!("Unit {}: frame dropped ({})", self.unit, e)
                }
                PublishOutcome::Published | PublishOutcome::NoReading => {}
            }
            ticker.set_period(self.settings.publish_interval.get());
        }
        debug!("Unit {}: publishing stopped", self.unit);
    }

    /// Start the sampling and publishing threads.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<Vec<JoinHandle<()>>> {
        let sampler = Arc::clone(self);
        let sampling = thread::Builder::new()
            .name(format!("sample-{}", self.unit))
            .spawn(move || sampler.run_sampling())?;
        let publisher = Arc::clone(self);
        let publishing = thread::Builder::new()
            .name(format!("publish-{}", self.unit))
            .spawn(move || publisher.run_publishing())?;
        Ok(vec![sampling, publishing])
    }
}

/// One-line summary of which loggers are online.
pub fn status_line<S: RegisterSource + 'static>(pollers: &[Arc<Poller<S>>]) -> String {
    let offline: Vec<String> = pollers
        .iter()
        .filter(|p| !p.is_online())
        .map(|p| p.unit().to_string())
        .collect();
    if offline.is_empty() {
        format!("Status: All {} loggers online", pollers.len())
    } else {
        format!(
            "Status: {}/{} loggers online. Offline: {}",
            pollers.len() - offline.len(),
            pollers.len(),
            offline.join(", ")
        )
    }
}
