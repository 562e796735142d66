//! This module defines range-checked line settings for the software UART,
//! and the frame layout they imply.

use snafu::{ensure, OptionExt, Snafu};

use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::{Deref, Not};
use core::str::FromStr;
use core::time::Duration;

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The value isn't one of the supported standard baud rates.
    #[snafu(display("Unsupported baud rate"))]
    InvalidBaudRate,
    /// The string isn't valid `<baud>-8<N|E><1|2>[-inv]` notation.
    #[snafu(display("Invalid line settings {:?}", settings))]
    InvalidLineSettings { settings: String },
}

const fn invalid_baud_rate() -> InvalidBaudRateSnafu {
    InvalidBaudRateSnafu
}

/// Logic level of a pin, or of one bit on the line.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub const fn is_high(self) -> bool {
        matches!(self, Level::High)
    }

    /// Apply inverting logic, if configured.
    pub fn invert_if(self, invert: bool) -> Self {
        if invert {
            !self
        } else {
            self
        }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Self::Output {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Pin direction. Outputs are configured with an initial level, so that
/// switching direction never glitches the line.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub enum Direction {
    In,
    Out(Level),
}

/// A (duration, level) pair: how long the line held one logic level.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct BitSpan {
    pub duration: Duration,
    pub level: Level,
}

impl BitSpan {
    pub const fn new(duration: Duration, level: Level) -> Self {
        Self { duration, level }
    }
}

/// Baud rates accepted by [`BaudRate::new`].
pub const STANDARD_BAUD_RATES: [u32; 10] = [
    300, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115_200,
];

/// `BaudRate` is one of the [`STANDARD_BAUD_RATES`].
///
/// ## Example
/// ```
/// use akp_link::BaudRate;
/// use std::convert::TryInto;
/// let rate = BaudRate::new(9600).unwrap();
/// let rate: BaudRate = 115200.try_into().unwrap();
/// assert!(BaudRate::new(9601).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct BaudRate(u32);

/// Create a new [`BaudRate`], panics if it isn't a standard rate.
pub const fn baud(rate: u32) -> BaudRate {
    let mut i = 0;
    while i < STANDARD_BAUD_RATES.len() {
        if STANDARD_BAUD_RATES[i] == rate {
            return BaudRate(rate);
        }
        i += 1;
    }
    panic!("Unsupported baud rate.")
}

impl BaudRate {
    /// Create a new baud rate, checking that it is a standard rate.
    /// # Errors
    /// Returns [`Error::InvalidBaudRate`] for any other value.
    pub fn new(rate: impl TryInto<u32>) -> Result<Self, Error> {
        let rate = rate.try_into().ok().with_context(invalid_baud_rate)?;
        ensure!(STANDARD_BAUD_RATES.contains(&rate), invalid_baud_rate());
        Ok(Self(rate))
    }

    /// Nominal duration of one bit, truncated to whole nanoseconds.
    pub const fn bit_period(self) -> Duration {
        Duration::from_nanos(1_000_000_000 / self.0 as u64)
    }
}

impl Deref for BaudRate {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Line settings of one software UART channel.
///
/// Frames are always 8 data bits, least significant bit first, with optional
/// even parity and one or two stop bits.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
pub struct BitTimingConfig {
    baud: BaudRate,
    parity: bool,
    second_stop_bit: bool,
    inverting_logic: bool,
}

impl BitTimingConfig {
    /// 8N1 at the given rate, non-inverted.
    pub const fn new(baud: BaudRate) -> Self {
        Self {
            baud,
            parity: false,
            second_stop_bit: false,
            inverting_logic: false,
        }
    }

    pub const fn with_parity(mut self, parity: bool) -> Self {
        self.parity = parity;
        self
    }

    pub const fn with_second_stop_bit(mut self, second_stop_bit: bool) -> Self {
        self.second_stop_bit = second_stop_bit;
        self
    }

    pub const fn with_inverting_logic(mut self, inverting_logic: bool) -> Self {
        self.inverting_logic = inverting_logic;
        self
    }

    pub const fn baud(&self) -> BaudRate {
        self.baud
    }

    pub const fn parity(&self) -> bool {
        self.parity
    }

    pub const fn second_stop_bit(&self) -> bool {
        self.second_stop_bit
    }

    pub const fn inverting_logic(&self) -> bool {
        self.inverting_logic
    }

    pub const fn bit_period(&self) -> Duration {
        self.baud.bit_period()
    }

    pub const fn stop_bits(&self) -> usize {
        if self.second_stop_bit {
            2
        } else {
            1
        }
    }

    /// Start bit, data bits, parity and trailing stop bit(s).
    pub const fn base_frame_bits(&self) -> usize {
        1 + 8 + self.parity as usize + self.stop_bits()
    }

    /// A base frame preceded by the stop bit(s) of whatever came before it.
    /// This is the window a receiver needs to recognise a start bit.
    pub const fn frame_bits(&self) -> usize {
        self.stop_bits() + self.base_frame_bits()
    }

    /// Logic level of an idle line, as driven on the pin.
    pub fn idle_level(&self) -> Level {
        Level::High.invert_if(self.inverting_logic)
    }
}

impl fmt::Display for BitTimingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-8{}{}",
            *self.baud,
            if self.parity { 'E' } else { 'N' },
            self.stop_bits()
        )?;
        if self.inverting_logic {
            write!(f, "-inv")?;
        }
        Ok(())
    }
}

impl FromStr for BitTimingConfig {
    type Err = Error;

    /// Parse the conventional notation, e.g. `9600-8N1` or `115200-8E2-inv`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::nom_parser::line_settings(s.as_bytes()).ok_or_else(|| Error::InvalidLineSettings {
            settings: s.to_string(),
        })
    }
}


#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let c = BitTimingConfig::new(baud(9600));
        assert_eq!(c.base_frame_bits(), 10);
        assert_eq!(c.frame_bits(), 11);

        let c = c.with_parity(true);
        assert_eq!(c.base_frame_bits(), 11);
        assert_eq!(c.frame_bits(), 12);

        let c = c.with_second_stop_bit(true);
        assert_eq!(c.base_frame_bits(), 12);
        assert_eq!(c.frame_bits(), 14);
        assert_eq!(c.stop_bits(), 2);
    }

    #[test]
    fn test_idle_level() {
        let c = BitTimingConfig::new(baud(1200));
        assert_eq!(c.idle_level(), Level::High);
        assert_eq!(c.with_inverting_logic(true).idle_level(), Level::Low);
    }

    #[test]
    fn test_line_settings_notation() {
        let c: BitTimingConfig = "9600-8N1".parse().unwrap();
        assert_eq!(c, BitTimingConfig::new(baud(9600)));

        let c: BitTimingConfig = "115200-8E2-inv".parse().unwrap();
        assert!(c.parity() && c.second_stop_bit() && c.inverting_logic());
        assert_eq!(*c.baud(), 115_200);
        assert_eq!(c.to_string(), "115200-8E2-inv");

        assert!("9600-7N1".parse::<BitTimingConfig>().is_err());
        assert!("9601-8N1".parse::<BitTimingConfig>().is_err());
        assert!("9600-8O1".parse::<BitTimingConfig>().is_err());
        assert!("9600-8N1-".parse::<BitTimingConfig>().is_err());
    }
}
