//! Frame layout shared by the transmitter and both receivers.

use crate::types::{BitTimingConfig, Level};

/// Even parity bit for `byte`: high when the data has an odd number of ones.
pub(crate) fn even_parity(byte: u8) -> Level {
    Level::from(byte.count_ones() % 2 == 1)
}

/// Check and decode one frame.
///
/// `bit(k)` returns the k:th bit of the frame. The frame starts with
/// `lead_stop_bits` high bits, followed by the start bit, 8 data bits,
/// optional parity and the trailing stop bit(s).
pub(crate) fn decode_frame(
    config: &BitTimingConfig,
    lead_stop_bits: usize,
    bit: impl Fn(usize) -> Level,
) -> Option<u8> {
    if (0..lead_stop_bits).any(|k| bit(k) != Level::High) {
        return None;
    }
    let start = lead_stop_bits;
    if bit(start) != Level::Low {
        return None;
    }
    let byte = (0..8).fold(0u8, |acc, d| acc | (u8::from(bit(start + 1 + d).is_high()) << d));

    let mut next = start + 9;
    if config.parity() {
        if bit(next) != even_parity(byte) {
            return None;
        }
        next += 1;
    }
    if (next..next + config.stop_bits()).any(|k| bit(k) != Level::High) {
        return None;
    }
    Some(byte)
}
