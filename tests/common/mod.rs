#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use akp_link::pin::Error as PinError;
use akp_link::rx::{drain_queue, EdgeCapture, SpanDecoder};
use akp_link::rx_poll::PollingReceiver;
use akp_link::span_queue::SpanQueue;
use akp_link::timer::{BitTimer, Clock, SimClock};
use akp_link::tx::Transmitter;
use akp_link::{BitTimingConfig, DigitalPin, Direction, Level};

pub type Writes = Arc<Mutex<Vec<(Duration, Level)>>>;

/// Output pin recording every level written, with its virtual time.
#[derive(Clone)]
pub struct RecordingPin {
    clock: SimClock,
    pub writes: Writes,
}

impl RecordingPin {
    pub fn new(clock: &SimClock) -> Self {
        RecordingPin {
            clock: clock.clone(),
            writes: Arc::default(),
        }
    }

    pub fn take_writes(&self) -> Vec<(Duration, Level)> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }
}

impl DigitalPin for RecordingPin {
    fn read(&mut self) -> Result<Level, PinError> {
        Ok(self
            .writes
            .lock()
            .unwrap()
            .last()
            .map_or(Level::High, |&(_, l)| l))
    }

    fn write(&mut self, level: Level) -> Result<(), PinError> {
        self.writes.lock().unwrap().push((self.clock.now(), level));
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), PinError> {
        if let Direction::Out(level) = direction {
            self.write(level)?;
        }
        Ok(())
    }
}

/// Input pin replaying recorded writes against a (separate) virtual clock.
pub struct WaveformPin {
    clock: SimClock,
    writes: Vec<(Duration, Level)>,
    idle: Level,
}

impl WaveformPin {
    pub fn new(clock: &SimClock, writes: Vec<(Duration, Level)>, idle: Level) -> Self {
        WaveformPin {
            clock: clock.clone(),
            writes,
            idle,
        }
    }
}

impl DigitalPin for WaveformPin {
    fn read(&mut self) -> Result<Level, PinError> {
        let now = self.clock.now();
        Ok(self
            .writes
            .iter()
            .take_while(|&&(t, _)| t <= now)
            .last()
            .map_or(self.idle, |&(_, l)| l))
    }

    fn write(&mut self, _level: Level) -> Result<(), PinError> {
        Ok(())
    }

    fn set_direction(&mut self, _direction: Direction) -> Result<(), PinError> {
        Ok(())
    }
}

/// Run the transmitter on virtual time and return the pin writes.
pub fn transmit(config: BitTimingConfig, bytes: &[u8]) -> Vec<(Duration, Level)> {
    let clock = SimClock::new();
    let pin = RecordingPin::new(&clock);
    let mut tx = Transmitter::new(config, pin.clone(), clock);
    tx.idle().unwrap();
    for &byte in bytes {
        tx.send_byte(byte);
    }
    pin.take_writes()
}

/// Feed pin writes through edge capture and the span decoder, then let the
/// line go idle so the last frame is flushed.
pub fn receive_edges(config: BitTimingConfig, writes: &[(Duration, Level)]) -> Vec<u8> {
    let queue = Arc::new(SpanQueue::new(64));
    let idle = config.idle_level();
    let mut capture = EdgeCapture::new(&config, queue.clone(), Duration::ZERO, idle);
    let mut decoder = SpanDecoder::new(config);
    let mut out = Vec::new();
    for &(t, level) in writes {
        capture.on_edge(t, level);
        drain_queue(&queue, &mut decoder, &mut out);
    }
    assert!(capture.check_idle(settle_time(config, writes)));
    drain_queue(&queue, &mut decoder, &mut out);
    assert_eq!(queue.dropped(), 0);
    out
}

/// Replay writes the way the channel threads see them. The edge watcher
/// samples at every write and every `poll` in between, and the decoder
/// drains the queue after every `drain_every` polls.
pub fn receive_threaded(
    config: BitTimingConfig,
    writes: &[(Duration, Level)],
    poll: Duration,
    drain_every: usize,
) -> Vec<u8> {
    let queue = Arc::new(SpanQueue::new(256));
    let mut level = config.idle_level();
    let mut capture = EdgeCapture::new(&config, queue.clone(), Duration::ZERO, level);
    let mut decoder = SpanDecoder::new(config);
    let mut out = Vec::new();

    let end = settle_time(config, writes);
    let mut pending = writes.iter().peekable();
    let mut now = Duration::ZERO;
    let mut polls = 0;
    while now <= end {
        while let Some(&&(t, l)) = pending.peek() {
            if t > now {
                break;
            }
            capture.sample(t, l);
            level = l;
            pending.next();
        }
        capture.sample(now, level);
        polls += 1;
        if polls % drain_every == 0 {
            drain_queue(&queue, &mut decoder, &mut out);
        }
        now += poll;
    }
    drain_queue(&queue, &mut decoder, &mut out);
    assert_eq!(queue.dropped(), 0);
    out
}

/// A time by which the line has been idle long enough to flush everything.
pub fn settle_time(config: BitTimingConfig, writes: &[(Duration, Level)]) -> Duration {
    let end = writes.last().map_or(Duration::ZERO, |&(t, _)| t);
    end + config.bit_period() * (4 * config.frame_bits()) as u32
}

/// Sample recorded writes with the polling receiver.
pub fn receive_polling(
    config: BitTimingConfig,
    writes: Vec<(Duration, Level)>,
    oversampling: u32,
) -> Vec<u8> {
    let end = writes.last().map_or(Duration::ZERO, |&(t, _)| t);
    let clock = SimClock::new();
    let mut pin = WaveformPin::new(&clock, writes, config.idle_level());
    let mut timer = BitTimer::new(clock.clone());
    let mut rx = PollingReceiver::new(config, oversampling);
    let mut out = Vec::new();
    while clock.now() < end + config.bit_period() * 4 {
        if let Some(byte) = rx.step(&mut pin, &mut timer) {
            out.push(byte);
        }
    }
    out
}

/// Linear congruential generator, for repeatable noise.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    /// Uniform in `-range..=range`.
    pub fn symmetric(&mut self, range: i64) -> i64 {
        i64::from(self.next_u32()) % (2 * range + 1) - range
    }
}
