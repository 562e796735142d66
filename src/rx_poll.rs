//! Polling receiver: samples the pin at a multiple of the baud rate.
//!
//! Simpler and cheaper than the span decoder, but it tolerates less jitter.

use log::{trace, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::frame::decode_frame;
use crate::pin::DigitalPin;
use crate::ring_buffer::ByteSink;
use crate::timer::{BitTimer, Clock};
use crate::types::{BitTimingConfig, Level};

/// Samples per bit used by default.
pub const DEFAULT_OVERSAMPLING: u32 = 2;

/// Majority-vote bit sampler with a shift-register frame check.
#[derive(Debug, Clone)]
pub struct PollingReceiver {
    config: BitTimingConfig,
    oversampling: u32,
    /// Received bits, the oldest in bit 0.
    shift: u32,
    count: usize,
    last_read_failed: bool,
}

impl PollingReceiver {
    /// # Panics
    /// If `oversampling` is less than 2.
    pub fn new(config: BitTimingConfig, oversampling: u32) -> Self {
        assert!(oversampling >= 2, "at least two samples per bit are needed");
        Self {
            config,
            oversampling,
            shift: 0,
            count: 0,
            last_read_failed: false,
        }
    }

    fn sample<P: DigitalPin, C: Clock>(
        &mut self,
        pin: &mut P,
        timer: &mut BitTimer<C>,
        part: Duration,
    ) -> Level {
        timer.wait(part);
        match pin.read() {
            Ok(level) => {
                self.last_read_failed = false;
                level.invert_if(self.config.inverting_logic())
            }
            Err(e) => {
                if !self.last_read_failed {
                    warn!("Software UART: rx pin read failed: {}", e);
                }
                self.last_read_failed = true;
                Level::High
            }
        }
    }

    /// Sample one bit period and return the majority level.
    ///
    /// When the level changes within the bit, sampling is shifted so that
    /// following bits are sampled after the edge.
    pub fn receive_bit<P: DigitalPin, C: Clock>(
        &mut self,
        pin: &mut P,
        timer: &mut BitTimer<C>,
    ) -> Level {
        let samples = i64::from(self.oversampling);
        let majority = samples / 2;
        let part = self.config.bit_period() / self.oversampling;

        let first = self.sample(pin, timer, part);
        let mut current = first;
        let mut first_run = 1;
        let mut second_run = 0;
        let mut i = 0;
        while i < samples - 1 {
            let last = current;
            current = self.sample(pin, timer, part);
            if current == last {
                if current == first {
                    first_run += 1;
                } else {
                    second_run += 1;
                }
            } else if current != first {
                if first_run >= majority {
                    timer.rewind(part);
                    return first;
                }
                // Too few samples before the edge: resynchronise on it.
                second_run = 1;
                i -= first_run;
            } else {
                if second_run >= majority {
                    timer.rewind(part);
                    return !first;
                }
                return Level::High;
            }
            i += 1;
        }
        current
    }

    /// Receive one bit and check for a complete frame.
    pub fn step<P: DigitalPin, C: Clock>(
        &mut self,
        pin: &mut P,
        timer: &mut BitTimer<C>,
    ) -> Option<u8> {
        let frame = self.config.base_frame_bits();
        let level = self.receive_bit(pin, timer);
        self.shift >>= 1;
        if level.is_high() {
            self.shift |= 1 << (frame - 1);
        }
        self.count += 1;
        if self.count < frame {
            return None;
        }
        let shift = self.shift;
        let byte = decode_frame(&self.config, 0, |k| Level::from(shift >> k & 1 == 1))?;
        trace!("Software UART: polled {:#04x}", byte);
        self.count = 0;
        Some(byte)
    }

    /// Receive into `sink` until `running` is cleared.
    pub fn run<P: DigitalPin, C: Clock, S: ByteSink>(
        &mut self,
        pin: &mut P,
        timer: &mut BitTimer<C>,
        sink: &mut S,
        running: &AtomicBool,
    ) {
        timer.reset();
        while running.load(Ordering::SeqCst) {
            if let Some(byte) = self.step(pin, timer) {
                sink.put(byte);
            }
        }
    }
}
