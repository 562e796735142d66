//! Bit-banged transmitter.

use log::warn;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::frame::even_parity;
use crate::pin::{DigitalPin, Error as PinError};
use crate::ring_buffer::RingBuffer;
use crate::timer::{BitTimer, Clock};
use crate::types::{BitTimingConfig, Direction, Level};

/// How long an idle transmitter waits before looking for more data.
pub const IDLE_POLL: Duration = Duration::from_millis(1);

/// Drives one output pin, one frame per byte.
///
/// Every level change happens at an absolute deadline: the previous level is
/// held for its full duration, then the new level is written.
pub struct Transmitter<P, C> {
    config: BitTimingConfig,
    pin: P,
    timer: BitTimer<C>,
    /// Hold time of the idle level before the next start bit.
    stop_hold: Duration,
}

impl<P: DigitalPin, C: Clock> Transmitter<P, C> {
    pub fn new(config: BitTimingConfig, pin: P, clock: C) -> Self {
        Self {
            config,
            pin,
            timer: BitTimer::new(clock),
            stop_hold: config.bit_period(),
        }
    }

    /// Configure the pin as an output at the idle level.
    pub fn idle(&mut self) -> Result<(), PinError> {
        self.pin.export()?;
        self.pin
            .set_direction(Direction::Out(self.config.idle_level()))?;
        self.timer.reset();
        Ok(())
    }

    fn hold_then_set(&mut self, hold: Duration, level: Level) {
        self.timer.wait(hold);
        let level = level.invert_if(self.config.inverting_logic());
        if let Err(e) = self.pin.write(level) {
            warn!("Software UART: tx pin write failed: {}", e);
        }
    }

    /// Transmit one frame: start bit, data bits LSB first, optional even
    /// parity, then the stop level.
    pub fn send_byte(&mut self, byte: u8) {
        let bit = self.config.bit_period();
        self.hold_then_set(self.stop_hold, Level::Low);
        for d in 0..8 {
            self.hold_then_set(bit, Level::from(byte >> d & 1 == 1));
        }
        if self.config.parity() {
            self.hold_then_set(bit, even_parity(byte));
        }
        self.hold_then_set(bit, Level::High);
        self.stop_hold = bit * self.config.stop_bits() as u32;
    }

    /// Hold the current level for `duration`.
    pub fn pause(&mut self, duration: Duration) {
        self.timer.wait(duration);
    }

    /// Send bytes from `source` until `running` is cleared.
    pub fn run(&mut self, source: &RingBuffer, running: &AtomicBool) {
        self.timer.reset();
        while running.load(Ordering::SeqCst) {
            match source.pop() {
                Some(byte) => self.send_byte(byte),
                None => self.pause(IDLE_POLL),
            }
        }
    }

    pub fn config(&self) -> &BitTimingConfig {
        &self.config
    }

    /// Give back the pin, e.g. to unexport it.
    pub fn into_pin(self) -> P {
        self.pin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::MockPin;
    use crate::timer::SimClock;
    use crate::types::baud;
    use std::sync::{Arc, Mutex};

    /// Records every write with the virtual time it happened at.
    #[derive(Clone)]
    struct Recorder {
        clock: SimClock,
        writes: Arc<Mutex<Vec<(Duration, Level)>>>,
    }

    impl DigitalPin for Recorder {
        fn read(&mut self) -> Result<Level, PinError> {
            Ok(Level::High)
        }

        fn write(&mut self, level: Level) -> Result<(), PinError> {
            self.writes.lock().unwrap().push((self.clock.now(), level));
            Ok(())
        }

        fn set_direction(&mut self, _direction: Direction) -> Result<(), PinError> {
            Ok(())
        }
    }

    fn recorder() -> (Recorder, SimClock) {
        let clock = SimClock::new();
        let pin = Recorder {
            clock: clock.clone(),
            writes: Arc::default(),
        };
        (pin, clock)
    }

    #[test]
    fn test_frame_timing() {
        let config = BitTimingConfig::new(baud(9600)).with_parity(true);
        let (pin, clock) = recorder();
        let writes = pin.writes.clone();
        let mut tx = Transmitter::new(config, pin, clock);
        tx.send_byte(0x01);

        let bit = config.bit_period();
        let writes = writes.lock().unwrap();
        assert_eq!(writes.len(), 1 + 8 + 1 + 1);
        for (i, &(at, _)) in writes.iter().enumerate() {
            assert_eq!(at, bit * (i as u32 + 1));
        }
        let levels: Vec<Level> = writes.iter().map(|&(_, l)| l).collect();
        assert_eq!(levels[0], Level::Low);
        assert_eq!(levels[1], Level::High);
        assert!(levels[2..9].iter().all(|&l| l == Level::Low));
        assert_eq!(levels[9], Level::High); // one data bit set: odd, parity high
        assert_eq!(levels[10], Level::High);
    }

    #[test]
    fn test_second_stop_bit() {
        let config = BitTimingConfig::new(baud(1200)).with_second_stop_bit(true);
        let (pin, clock) = recorder();
        let writes = pin.writes.clone();
        let mut tx = Transmitter::new(config, pin, clock);
        tx.send_byte(0);
        tx.send_byte(0);

        let bit = config.bit_period();
        let writes = writes.lock().unwrap();
        // Stop level set at 10 bits, next start after two stop bits.
        assert_eq!(writes[9], (bit * 10, Level::High));
        assert_eq!(writes[10], (bit * 12, Level::Low));
    }

    #[test]
    fn test_inverting_logic() {
        let config = BitTimingConfig::new(baud(9600)).with_inverting_logic(true);
        let line = MockPin::new(Level::High);
        let mut tx = Transmitter::new(config, line.clone(), SimClock::new());
        tx.idle().unwrap();
        assert_eq!(line.level(), Level::Low);
        tx.send_byte(0xff);
        assert_eq!(line.level(), Level::Low);
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let config = BitTimingConfig::new(baud(9600));
        let line = MockPin::new(Level::High);
        let clock = SimClock::new();
        let mut tx = Transmitter::new(config, line.clone(), clock.clone());
        tx.idle().unwrap();
        line.set_failing(true);
        tx.send_byte(0x55);
        assert_eq!(clock.now(), config.bit_period() * 10);
    }
}
