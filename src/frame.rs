//! Binary data frame consumed by the downstream parser.
//!
//! Layout, all big-endian:
//!
//! | offset | size    | content                                   |
//! |--------|---------|-------------------------------------------|
//! | 0      | 4       | Unix timestamp (seconds)                  |
//! | 4      | 39 × 2  | register words rebuilt from the reading   |
//! | 82     | 19 × 4  | window min/max/avg ×1000 per channel, then sample count |

use bytes::BufMut;
use thiserror::Error;

use crate::aggregate::AggregationSnapshot;
use crate::meter::{Channel, Reading};

pub const REGISTER_WORDS: usize = 39;
pub const AGGREGATE_WORDS: usize = 19;
pub const FRAME_LEN: usize = 4 + REGISTER_WORDS * 2 + AGGREGATE_WORDS * 4;

const RESERVED_WORDS: usize = 4;

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("{field} is not a finite number")]
    NonFinite { field: &'static str },
}

/// Truncates toward zero; callers keep the low 32 bits, so negative values
/// travel as two's complement.
fn scaled(value: f64, factor: f64) -> i64 {
    (value * factor) as i64
}

fn hi_lo(value: i64) -> [u16; 2] {
    [((value >> 16) & 0xFFFF) as u16, (value & 0xFFFF) as u16]
}

fn register_words(reading: &Reading) -> Vec<u16> {
    let mut words = Vec::with_capacity(REGISTER_WORDS);
    words.extend(hi_lo(reading.device_serial as i64));
    for v in [
        reading.voltage_l1,
        reading.voltage_l2,
        reading.voltage_l3,
        reading.current_l1,
        reading.current_l2,
        reading.current_l3,
        reading.current_n,
    ] {
        words.extend(hi_lo(scaled(v, 1000.0)));
    }
    for p in [
        reading.active_power,
        reading.reactive_power,
        reading.apparent_power,
    ] {
        words.extend(hi_lo(scaled(p, 100.0)));
    }
    words.push(reading.sign_active);
    words.push(reading.sign_reactive);
    words.extend(hi_lo(scaled(reading.chained_voltage_l1l2, 1000.0)));
    words.push(scaled(reading.frequency.clamp(0.0, 100.0), 10.0).clamp(0, 1000) as u16);
    words.extend(hi_lo(scaled(reading.consumed_energy, 1000.0)));
    words.extend(hi_lo(scaled(reading.delivered_energy, 1000.0)));
    words.push((scaled(reading.power_factor, 100.0) & 0xFFFF) as u16);
    words.push(reading.sector_power_factor);
    words.push(reading.ct_ratio);
    words.push(reading.operating_hours);
    words.extend([0u16; RESERVED_WORDS]);
    words
}

fn aggregate_words(snapshot: &AggregationSnapshot) -> Vec<u32> {
    let mut words = Vec::with_capacity(AGGREGATE_WORDS);
    for channel in Channel::ALL {
        for v in [
            snapshot.min(channel),
            snapshot.max(channel),
            snapshot.average(channel),
        ] {
            words.push(scaled(v, 1000.0) as u32);
        }
    }
    words.push(snapshot.count());
    words
}

fn check_finite(reading: &Reading, snapshot: &AggregationSnapshot) -> Result<(), EncodeError> {
    for (field, value) in reading.float_fields() {
        if !value.is_finite() {
            return Err(EncodeError::NonFinite { field });
        }
    }
    for channel in Channel::ALL {
        let stats = [
            snapshot.min(channel),
            snapshot.max(channel),
            snapshot.average(channel),
        ];
        if stats.iter().any(|v| !v.is_finite()) {
            return Err(EncodeError::NonFinite {
                field: "aggregation window",
            });
        }
    }
    Ok(())
}

/// Pack a reading and a window snapshot into a [`FRAME_LEN`]-byte frame.
pub fn encode(
    reading: &Reading,
    snapshot: &AggregationSnapshot,
    timestamp: u32,
) -> Result<Vec<u8>, EncodeError> {
    check_finite(reading, snapshot)?;

    let mut buf = Vec::with_capacity(FRAME_LEN);
    buf.put_u32(timestamp);
    for word in register_words(reading) {
        buf.put_u16(word);
    }
    for word in aggregate_words(snapshot) {
        buf.put_u32(word);
    }
    debug_assert_eq!(buf.len(), FRAME_LEN);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::decode::tests::fixed_blocks;
    use crate::decode::decode;
    use crate::meter::DeviceFamily;
    use bytes::Buf;

    struct DecodedFrame {
        timestamp: u32,
        words: Vec<u16>,
        aggregates: Vec<u32>,
    }

    fn parse(mut frame: &[u8]) -> DecodedFrame {
        assert_eq!(frame.len(), FRAME_LEN);
        let timestamp = frame.get_u32();
        let words = (0..REGISTER_WORDS).map(|_| frame.get_u16()).collect();
        let aggregates = (0..AGGREGATE_WORDS).map(|_| frame.get_u32()).collect();
        assert!(frame.is_empty());
        DecodedFrame {
            timestamp,
            words,
            aggregates,
        }
    }

    fn joined(words: &[u16], index: usize) -> u32 {
        (words[index] as u32) << 16 | words[index + 1] as u32
    }

    fn sample() -> Reading {
        Reading {
            device_serial: 0x0001_2345,
            voltage_l1: 231.5,
            voltage_l2: 229.5,
            voltage_l3: 230.0,
            current_l1: 12.5,
            current_l2: 0.25,
            current_l3: 7.0,
            current_n: 0.75,
            active_power: 5000.5,
            reactive_power: -250.25,
            apparent_power: 5100.0,
            frequency: 50.02,
            consumed_energy: 123_456.75,
            delivered_energy: 42.0,
            power_factor: 0.75,
            sector_power_factor: 2,
            sign_active: 1,
            sign_reactive: 1,
            chained_voltage_l1l2: 400.5,
            ct_ratio: 6000,
            operating_hours: 1234,
        }
    }

    #[test]
    fn frame_has_fixed_length() {
        assert_eq!(FRAME_LEN, 158);
        let frame = encode(&sample(), &AggregationSnapshot::empty(), 0).unwrap();
        assert_eq!(frame.len(), 158);
    }

    #[test]
    fn register_section_layout() {
        let frame = encode(&sample(), &AggregationSnapshot::empty(), 1_700_000_000).unwrap();
        let f = parse(&frame);
        assert_eq!(f.timestamp, 1_700_000_000);
        let w = &f.words;
        assert_eq!(joined(w, 0), 0x0001_2345);
        assert_eq!(joined(w, 2), 231_500);
        assert_eq!(joined(w, 4), 229_500);
        assert_eq!(joined(w, 6), 230_000);
        assert_eq!(joined(w, 8), 12_500);
        assert_eq!(joined(w, 10), 250);
        assert_eq!(joined(w, 12), 7_000);
        assert_eq!(joined(w, 14), 750);
        assert_eq!(joined(w, 16), 500_050);
        assert_eq!(joined(w, 18) as i32, -25_025);
        assert_eq!(joined(w, 20), 510_000);
        assert_eq!((w[22], w[23]), (1, 1));
        assert_eq!(joined(w, 24), 400_500);
        assert_eq!(w[26], 500);
        assert_eq!(joined(w, 27), 123_456_750);
        assert_eq!(joined(w, 29), 42_000);
        assert_eq!(w[31], 75);
        assert_eq!(w[32], 2);
        assert_eq!(w[33], 6000);
        assert_eq!(w[34], 1234);
        assert_eq!(&w[35..], &[0, 0, 0, 0]);
    }

    #[test]
    fn frequency_word_is_clamped() {
        let empty = AggregationSnapshot::empty();
        let low = Reading {
            frequency: -5.0,
            ..sample()
        };
        let high = Reading {
            frequency: 150.0,
            ..sample()
        };
        assert_eq!(parse(&encode(&low, &empty, 0).unwrap()).words[26], 0);
        assert_eq!(parse(&encode(&high, &empty, 0).unwrap()).words[26], 1000);
    }

    #[test]
    fn empty_window_encodes_zeros() {
        let f = parse(&encode(&sample(), &AggregationSnapshot::empty(), 0).unwrap());
        assert_eq!(f.aggregates, vec![0; AGGREGATE_WORDS]);
    }

    #[test]
    fn aggregates_truncate_toward_zero() {
        let agg = Aggregator::new();
        for v in [230.0004, 230.0006] {
            agg.accumulate(&Reading {
                voltage_l1: v,
                current_l1: -1.0009,
                ..Reading::default()
            });
        }
        let f = parse(&encode(&sample(), &agg.snapshot_and_reset(), 0).unwrap());
        assert_eq!(&f.aggregates[0..3], &[230_000, 230_000, 230_000]);
        assert_eq!(f.aggregates[9] as i32, -1000);
        assert_eq!(f.aggregates[18], 2);
    }

    #[test]
    fn constant_window_end_to_end() {
        let reading = decode(&fixed_blocks(5000), DeviceFamily::Fixed).unwrap();
        assert_eq!(reading.voltage_l1, 120.0);
        assert_eq!(reading.current_l1, 10.0);

        let agg = Aggregator::new();
        for _ in 0..5 {
            agg.accumulate(&reading);
        }
        let f = parse(&encode(&reading, &agg.snapshot_and_reset(), 42).unwrap());
        assert_eq!(&f.aggregates[0..3], &[120_000, 120_000, 120_000]);
        assert_eq!(&f.aggregates[9..12], &[10_000, 10_000, 10_000]);
        assert_eq!(f.aggregates[18], 5);
        assert_eq!(joined(&f.words, 2), 120_000);
    }

    #[test]
    fn non_finite_reading_is_rejected() {
        let bad = Reading {
            apparent_power: f64::NAN,
            ..sample()
        };
        assert_eq!(
            encode(&bad, &AggregationSnapshot::empty(), 0),
            Err(EncodeError::NonFinite {
                field: "apparent_power"
            })
        );
    }

    #[test]
    fn non_finite_window_is_rejected() {
        let agg = Aggregator::new();
        agg.accumulate(&Reading {
            current_l2: f64::INFINITY,
            ..Reading::default()
        });
        assert!(encode(&sample(), &agg.snapshot_and_reset(), 0).is_err());
    }
}
