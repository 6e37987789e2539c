use parking_lot::Mutex;

use crate::meter::{Channel, Reading};

/// Running statistics of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
}

impl ChannelStats {
    pub const EMPTY: ChannelStats = ChannelStats {
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        sum: 0.0,
    };

    fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    fn merge(&mut self, other: &ChannelStats) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Window {
    channels: [ChannelStats; 6],
    sample_count: u32,
}

impl Window {
    const EMPTY: Window = Window {
        channels: [ChannelStats::EMPTY; 6],
        sample_count: 0,
    };
}

/// A captured aggregation window. Never exposes the infinity sentinels: an
/// empty window reports zeros.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSnapshot {
    channels: [ChannelStats; 6],
    sample_count: u32,
}

impl AggregationSnapshot {
    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            channels: [ChannelStats::EMPTY; 6],
            sample_count: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.sample_count
    }

    pub fn min(&self, channel: Channel) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.channels[channel.index()].min
        }
    }

    pub fn max(&self, channel: Channel) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.channels[channel.index()].max
        }
    }

    pub fn average(&self, channel: Channel) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            self.channels[channel.index()].sum / self.sample_count as f64
        }
    }
}

/// Windowed min/max/average of the three phase voltages and currents.
///
/// The sampling activity calls [`Aggregator::accumulate`] while the publish
/// activity calls [`Aggregator::snapshot_and_reset`]; both take the same lock,
/// so a snapshot always holds whole samples.
#[derive(Debug)]
pub struct Aggregator {
    window: Mutex<Window>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window::EMPTY),
        }
    }

    pub fn accumulate(&self, reading: &Reading) {
        let mut window = self.window.lock();
        for channel in Channel::ALL {
            window.channels[channel.index()].add(reading.channel(channel));
        }
        window.sample_count = window.sample_count.saturating_add(1);
    }

    pub fn snapshot_and_reset(&self) -> AggregationSnapshot {
        let window = std::mem::replace(&mut *self.window.lock(), Window::EMPTY);
        AggregationSnapshot {
            channels: window.channels,
            sample_count: window.sample_count,
        }
    }

    /// Put a snapshot that could not be published back into the window, so
    /// its samples go out with the next one.
    pub fn restore(&self, snapshot: &AggregationSnapshot) {
        let mut window = self.window.lock();
        for (stats, taken) in window.channels.iter_mut().zip(snapshot.channels.iter()) {
            stats.merge(taken);
        }
        window.sample_count = window.sample_count.saturating_add(snapshot.sample_count);
    }

    #[cfg(test)]
    pub fn sample_count(&self) -> u32 {
        self.window.lock().sample_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn reading(voltage: f64, current: f64) -> Reading {
        Reading {
            voltage_l1: voltage,
            voltage_l2: voltage + 1.0,
            voltage_l3: voltage + 2.0,
            current_l1: current,
            current_l2: current * 2.0,
            current_l3: current * 3.0,
            ..Reading::default()
        }
    }

    #[test]
    fn tracks_min_max_average() {
        let agg = Aggregator::new();
        let voltages = [229.0, 231.5, 228.25, 235.0, 230.0];
        for (i, v) in voltages.iter().enumerate() {
            agg.accumulate(&reading(*v, i as f64));
        }
        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.count(), 5);
        assert_eq!(snap.min(Channel::VoltageL1), 228.25);
        assert_eq!(snap.max(Channel::VoltageL1), 235.0);
        assert_eq!(snap.min(Channel::VoltageL3), 230.25);
        let mean = voltages.iter().sum::<f64>() / 5.0;
        assert!((snap.average(Channel::VoltageL1) - mean).abs() < 1e-9);
        assert_eq!(snap.min(Channel::CurrentL3), 0.0);
        assert_eq!(snap.max(Channel::CurrentL3), 12.0);
        assert!((snap.average(Channel::CurrentL2) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_reports_zero() {
        let agg = Aggregator::new();
        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.count(), 0);
        for channel in Channel::ALL {
            assert_eq!(snap.min(channel), 0.0);
            assert_eq!(snap.max(channel), 0.0);
            assert_eq!(snap.average(channel), 0.0);
        }
        assert_eq!(snap, AggregationSnapshot::empty());
    }

    #[test]
    fn snapshot_resets_window() {
        let agg = Aggregator::new();
        agg.accumulate(&reading(500.0, 50.0));
        agg.snapshot_and_reset();
        agg.accumulate(&reading(100.0, 1.0));
        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.count(), 1);
        assert_eq!(snap.max(Channel::VoltageL1), 100.0);
        assert_eq!(agg.sample_count(), 0);
    }

    #[test]
    fn restore_merges_with_newer_samples() {
        let agg = Aggregator::new();
        agg.accumulate(&reading(220.0, 1.0));
        agg.accumulate(&reading(240.0, 3.0));
        let taken = agg.snapshot_and_reset();
        agg.accumulate(&reading(230.0, 2.0));
        agg.restore(&taken);
        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.count(), 3);
        assert_eq!(snap.min(Channel::VoltageL1), 220.0);
        assert_eq!(snap.max(Channel::VoltageL1), 240.0);
        assert!((snap.average(Channel::CurrentL1) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_snapshots_hold_whole_samples() {
        let agg = Arc::new(Aggregator::new());
        let writer = {
            let agg = Arc::clone(&agg);
            thread::spawn(move || {
                for k in 0..5000 {
                    let v = k as f64;
                    agg.accumulate(&Reading {
                        voltage_l1: v,
                        voltage_l2: v,
                        voltage_l3: v,
                        current_l1: v,
                        current_l2: v,
                        current_l3: v,
                        ..Reading::default()
                    });
                }
            })
        };

        let mut total = 0u64;
        let mut snapshots = Vec::new();
        while !writer.is_finished() {
            snapshots.push(agg.snapshot_and_reset());
        }
        writer.join().unwrap();
        snapshots.push(agg.snapshot_and_reset());

        for snap in &snapshots {
            total += snap.count() as u64;
            let avg = snap.average(Channel::VoltageL1);
            for channel in Channel::ALL {
                assert_eq!(snap.average(channel), avg);
                assert_eq!(snap.min(channel), snap.min(Channel::VoltageL1));
                assert_eq!(snap.max(channel), snap.max(Channel::VoltageL1));
            }
        }
        assert_eq!(total, 5000);
    }
}
