//! Span-based receiver with a scoring frame detector.
//!
//! Edges are timestamped by an [`EdgeCapture`] and handed over as
//! [`BitSpan`]s to a [`SpanDecoder`], which runs in three steps:
//!
//! 1. Each span is normalised against a running baud-rate estimate
//!    ([`BaudTracker`]), which absorbs a slow transmitter clock.
//! 2. The last few spans are kept in a [`SpanWindow`], where time is moved
//!    between neighbours until each span is close to a whole number of bits.
//!    This undoes edge jitter without changing the total time.
//! 3. The oldest span is expanded into bits and pushed into a [`BitWindow`].
//!    Every bit position where a valid frame ends gets a score, one more than
//!    the score of a valid frame directly before it. Runs of back-to-back
//!    frames build up high scores, while false frame starts inside real data
//!    rarely do. The best-scored frame is emitted once it reaches the front.

use log::{debug, trace};

use std::sync::Arc;
use std::time::Duration;

use arrayvec::ArrayVec;

use crate::frame::decode_frame;
use crate::ring_buffer::ByteSink;
use crate::span_queue::{RxEvent, SpanQueue};
use crate::types::{BitSpan, BitTimingConfig, Level};

/// Number of spans considered together when relaxing.
pub const SPAN_WINDOW_LEN: usize = 5;

/// Spans longer than this many bits are left alone by the relaxation.
const MAX_RELAX_BITS: i64 = 12;

/// Relaxation levels, in percent of a bit period.
const RELAX_LEVELS: [i64; 11] = [100, 95, 90, 85, 80, 75, 70, 65, 60, 55, 50];

/// Largest frame (8E2 plus lead stop bits) plus two base frames.
const MAX_BIT_WINDOW: usize = 14 + 2 * 12;

const CONSUMED: i32 = -1;

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Running estimate of the transmitter's actual bit period.
#[derive(Debug, Clone)]
pub struct BaudTracker {
    nominal: i64,
    period: i64,
}

impl BaudTracker {
    pub fn new(config: &BitTimingConfig) -> Self {
        let nominal = nanos(config.bit_period());
        Self {
            nominal,
            period: nominal,
        }
    }

    /// Update the estimate with a measured span, and return the span
    /// rescaled to the nominal bit period, in nanoseconds.
    ///
    /// Only spans within 75-125% of the estimated period are single bits,
    /// and only those update the estimate.
    pub fn observe(&mut self, raw: Duration) -> i64 {
        let raw = nanos(raw);
        let scaled_raw = i128::from(raw) * 100;
        let period = i128::from(self.period);
        if scaled_raw >= period * 75 && scaled_raw <= period * 125 {
            self.period = (63 * self.period + raw) / 64;
        }
        let scaled = i128::from(raw) * i128::from(self.nominal) / i128::from(self.period);
        i64::try_from(scaled).unwrap_or(i64::MAX)
    }

    /// The estimated bit period.
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period as u64)
    }

    /// The estimated baud rate of the transmitter.
    pub fn estimated_baud(&self) -> u32 {
        (1_000_000_000 / self.period) as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowSpan {
    original: i64,
    working: i64,
    level: Level,
}

/// The most recent spans, with adjusted ("working") durations.
#[derive(Debug, Clone)]
pub struct SpanWindow {
    spans: ArrayVec<WindowSpan, SPAN_WINDOW_LEN>,
    bit: i64,
    /// The oldest span has already been expanded into bits.
    front_consumed: bool,
}

impl SpanWindow {
    pub fn new(bit: Duration) -> Self {
        Self {
            spans: ArrayVec::new(),
            bit: nanos(bit),
            front_consumed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Add the newest span, evicting the oldest if the window is full.
    pub fn push(&mut self, duration: i64, level: Level) {
        if self.spans.is_full() {
            self.spans.remove(0);
            self.front_consumed = false;
        }
        self.spans.push(WindowSpan {
            original: duration,
            working: duration,
            level,
        });
    }

    /// Recompute the working durations from the originals, moving time
    /// between neighbours at decreasing tolerance levels. The sum of all
    /// durations is unchanged.
    pub fn relax(&mut self) {
        for span in self.spans.iter_mut() {
            span.working = span.original;
        }
        for &level in RELAX_LEVELS.iter() {
            self.relax_at(level);
        }
    }

    fn relax_at(&mut self, level: i64) {
        let bit = self.bit;
        for i in (1..self.spans.len()).rev() {
            let span = self.spans[i].working;
            if span > bit * MAX_RELAX_BITS {
                continue;
            }
            let missing = if span < bit {
                bit - span
            } else {
                let remainder = span % bit;
                if remainder * 100 > bit * level {
                    bit - remainder
                } else {
                    continue;
                }
            };
            self.spans[i - 1].working -= missing;
            self.spans[i].working += missing;
        }
    }

    /// Working durations, oldest first.
    pub fn durations(&self) -> impl Iterator<Item = (i64, Level)> + '_ {
        self.spans.iter().map(|s| (s.working, s.level))
    }

    /// The oldest span, once the window is full and it hasn't been taken yet.
    fn take_ready(&mut self) -> Option<(i64, Level)> {
        if self.spans.is_full() && !self.front_consumed {
            self.front_consumed = true;
            self.spans.first().map(|s| (s.working, s.level))
        } else {
            None
        }
    }

    /// Remove all spans not yet taken, oldest first.
    fn drain(&mut self) -> ArrayVec<(i64, Level), SPAN_WINDOW_LEN> {
        let skip = usize::from(self.front_consumed);
        let rest = self
            .spans
            .iter()
            .skip(skip)
            .map(|s| (s.working, s.level))
            .collect();
        self.spans.clear();
        self.front_consumed = false;
        rest
    }
}

#[derive(Debug, Clone, Copy)]
struct BitSample {
    level: Level,
    score: i32,
}

/// Circular window of the most recent bits and their frame scores.
/// Index 0 is the oldest bit.
#[derive(Debug, Clone)]
pub struct BitWindow {
    samples: [BitSample; MAX_BIT_WINDOW],
    capacity: usize,
    /// Index of the oldest sample.
    oldest: usize,
}

impl BitWindow {
    fn new(capacity: usize) -> Self {
        let idle = BitSample {
            level: Level::High,
            score: 0,
        };
        Self {
            samples: [idle; MAX_BIT_WINDOW],
            capacity: capacity.min(MAX_BIT_WINDOW),
            oldest: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self, index: usize) -> usize {
        (self.oldest + index) % self.capacity
    }

    fn level(&self, index: usize) -> Level {
        self.samples[self.slot(index)].level
    }

    fn score(&self, index: usize) -> i32 {
        self.samples[self.slot(index)].score
    }

    fn set_score(&mut self, index: usize, score: i32) {
        let slot = self.slot(index);
        self.samples[slot].score = score;
    }

    /// Push the newest bit, dropping the oldest.
    fn push(&mut self, level: Level) {
        let slot = self.oldest;
        self.samples[slot] = BitSample { level, score: 0 };
        self.oldest = (self.oldest + 1) % self.capacity;
    }
}

/// Turns spans into bytes. See the module documentation.
#[derive(Debug, Clone)]
pub struct SpanDecoder {
    config: BitTimingConfig,
    bit: i64,
    baud: BaudTracker,
    spans: SpanWindow,
    bits: BitWindow,
}

impl SpanDecoder {
    pub fn new(config: BitTimingConfig) -> Self {
        let capacity = config.frame_bits() + 2 * config.base_frame_bits();
        Self {
            config,
            bit: nanos(config.bit_period()),
            baud: BaudTracker::new(&config),
            spans: SpanWindow::new(config.bit_period()),
            bits: BitWindow::new(capacity),
        }
    }

    pub fn config(&self) -> &BitTimingConfig {
        &self.config
    }

    pub fn baud_tracker(&self) -> &BaudTracker {
        &self.baud
    }

    /// Process one measured span. Decoded bytes go to `sink`.
    pub fn push_span<S: ByteSink>(&mut self, span: BitSpan, sink: &mut S) {
        let normalized = self.baud.observe(span.duration);
        self.spans.push(normalized, span.level);
        self.spans.relax();
        if let Some((duration, level)) = self.spans.take_ready() {
            self.push_bits(duration, level, sink);
        }
    }

    /// The line has been idle: push out the spans still held back for
    /// relaxation, then enough idle bits to flush every pending frame.
    pub fn flush_idle<S: ByteSink>(&mut self, sink: &mut S) {
        for (duration, level) in self.spans.drain() {
            self.push_bits(duration, level, sink);
        }
        for _ in 0..2 * self.bits.capacity() {
            self.push_bit(Level::High, sink);
        }
    }

    fn push_bits<S: ByteSink>(&mut self, duration: i64, level: Level, sink: &mut S) {
        let count = (duration + self.bit / 2) / self.bit;
        let count = count.clamp(0, self.bits.capacity() as i64);
        for _ in 0..count {
            self.push_bit(level, sink);
        }
    }

    fn push_bit<S: ByteSink>(&mut self, level: Level, sink: &mut S) {
        self.bits.push(level);

        let frame = self.config.frame_bits();
        let base = self.config.base_frame_bits();
        let lead = self.config.stop_bits();
        let candidate = self.bits.capacity() - frame;

        if self.bits.score(candidate) == 0 {
            let bits = &self.bits;
            if decode_frame(&self.config, lead, |k| bits.level(candidate + k)).is_some() {
                let score = 1 + self.bits.score(candidate - base).max(0);
                self.bits.set_score(candidate, score);
                trace!("Software UART: frame candidate scored {}", score);
            }
        }

        if self.bits.score(0) == CONSUMED {
            return;
        }
        let mut best = None;
        for index in 0..base {
            let score = self.bits.score(index);
            if score >= 1 && best.map_or(true, |(_, s)| score > s) {
                best = Some((index, score));
            }
        }
        if let Some((index, score)) = best {
            let bits = &self.bits;
            if let Some(byte) = decode_frame(&self.config, lead, |k| bits.level(index + k)) {
                trace!("Software UART: received {:#04x}, score {}", byte, score);
                sink.put(byte);
            }
            for k in 0..index + base {
                self.bits.set_score(k, CONSUMED);
            }
        }
    }
}

/// Timestamps line transitions and queues the completed spans.
///
/// Runs on the edge-watching thread and never blocks. It also reports when
/// the line has been idle for two frame times, in line order with the spans,
/// so the decoder never flushes in the middle of a frame.
#[derive(Debug)]
pub struct EdgeCapture {
    queue: Arc<SpanQueue>,
    inverting_logic: bool,
    idle_after: Duration,
    last_edge: Duration,
    level: Level,
    idle_reported: bool,
}

impl EdgeCapture {
    /// `pin_level` is the level read from the pin at time `now`.
    pub fn new(
        config: &BitTimingConfig,
        queue: Arc<SpanQueue>,
        now: Duration,
        pin_level: Level,
    ) -> Self {
        Self {
            queue,
            inverting_logic: config.inverting_logic(),
            idle_after: config.bit_period() * (2 * config.frame_bits()) as u32,
            last_edge: now,
            level: pin_level.invert_if(config.inverting_logic()),
            idle_reported: false,
        }
    }

    /// One poll of the pin: record an edge if the level changed, then check
    /// for an idle line.
    pub fn sample(&mut self, now: Duration, pin_level: Level) {
        self.on_edge(now, pin_level);
        self.check_idle(now);
    }

    /// Record the pin level observed at `now`. A level equal to the current
    /// one isn't an edge and is ignored.
    pub fn on_edge(&mut self, now: Duration, pin_level: Level) {
        let level = pin_level.invert_if(self.inverting_logic);
        if level == self.level {
            return;
        }
        let duration = now.saturating_sub(self.last_edge);
        self.queue.push_span(BitSpan::new(duration, self.level));
        self.last_edge = now;
        self.level = level;
        self.idle_reported = false;
    }

    /// Queue an [`RxEvent::Idle`] once the line has been high for more than
    /// two frame times since the last edge. Returns true if one was queued.
    pub fn check_idle(&mut self, now: Duration) -> bool {
        if self.idle_reported {
            return false;
        }
        match self.idle_for(now) {
            Some(idle) if idle > self.idle_after => {
                self.queue.push(RxEvent::Idle);
                self.idle_reported = true;
                true
            }
            _ => false,
        }
    }

    /// How long the line has been idle (logically high) at `now`.
    pub fn idle_for(&self, now: Duration) -> Option<Duration> {
        if self.level.is_high() {
            Some(now.saturating_sub(self.last_edge))
        } else {
            None
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

/// Pass every queued event to `decoder`, flushing it at each idle event.
/// Returns the number of events processed.
pub fn drain_queue<S: ByteSink>(
    queue: &SpanQueue,
    decoder: &mut SpanDecoder,
    sink: &mut S,
) -> usize {
    let mut count = 0;
    while let Some(event) = queue.pop() {
        match event {
            RxEvent::Span(span) => decoder.push_span(span, sink),
            RxEvent::Idle => decoder.flush_idle(sink),
        }
        count += 1;
    }
    if count > 0 {
        debug!(
            "Software UART: processed {} spans, estimated {} baud",
            count,
            decoder.baud.estimated_baud()
        );
    }
    count
}
