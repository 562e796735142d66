//! A running software UART channel: pins, buffers and worker threads.
//!
//! ```no_run
//! use akp_link::channel::{GpioUart, Options};
//! use akp_link::timer::MonotonicClock;
//! use akp_link::{BitTimingConfig, SysfsPin};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: BitTimingConfig = "9600-8N1".parse()?;
//! let mut uart = GpioUart::start(
//!     config,
//!     SysfsPin::new(23),
//!     SysfsPin::new(24),
//!     MonotonicClock::new(),
//!     Options::default(),
//! )?;
//! uart.send(b"LA^-33000:b9");
//! let mut buf = [0; 64];
//! let n = uart.receive(&mut buf);
//! uart.stop();
//! # Ok(()) }
//! ```

use log::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::pin::{DigitalPin, Error as PinError};
use crate::ring_buffer::RingBuffer;
use crate::rx::{drain_queue, EdgeCapture, SpanDecoder};
use crate::rx_poll::{PollingReceiver, DEFAULT_OVERSAMPLING};
use crate::span_queue::SpanQueue;
use crate::timer::{BitTimer, Clock};
use crate::tx::Transmitter;
use crate::types::{BitTimingConfig, Direction, Level};

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not set up the rx pin: {}", source))]
    RxPin { source: PinError },
    #[snafu(display("Could not set up the tx pin: {}", source))]
    TxPin { source: PinError },
    #[snafu(display("Could not spawn the {} thread: {}", name, source))]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

/// How the receive side turns pin levels into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMode {
    /// Timestamp edges and decode spans with the scoring detector.
    Scoring,
    /// Sample the pin `oversampling` times per bit.
    Polling { oversampling: u32 },
}

/// Channel settings besides the line settings.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub rx_mode: RxMode,
    /// Capacity of each of the rx and tx byte buffers.
    pub buffer_capacity: usize,
    /// Capacity of the span queue between edge watcher and decoder.
    pub span_queue_capacity: usize,
    /// How often the span decoder looks for new spans.
    pub decode_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            rx_mode: RxMode::Scoring,
            buffer_capacity: 4096,
            span_queue_capacity: 1024,
            decode_interval: Duration::from_millis(1),
        }
    }
}

impl Options {
    pub fn with_rx_mode(mut self, rx_mode: RxMode) -> Self {
        self.rx_mode = rx_mode;
        self
    }

    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    /// Polling with the default oversampling rate.
    pub fn polling() -> Self {
        Self::default().with_rx_mode(RxMode::Polling {
            oversampling: DEFAULT_OVERSAMPLING,
        })
    }
}

/// A software UART running on two pins.
///
/// One thread transmits from the tx buffer. Receiving uses either an edge
/// watcher plus a decoder thread ([`RxMode::Scoring`]) or a single sampling
/// thread ([`RxMode::Polling`]). All threads stop on [`stop()`](Self::stop)
/// or drop.
pub struct GpioUart {
    config: BitTimingConfig,
    rx: Arc<RingBuffer>,
    tx: Arc<RingBuffer>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl GpioUart {
    /// Configure the pins and start the worker threads.
    ///
    /// # Errors
    /// Pin setup failures, and failure to spawn a thread, are fatal.
    /// Pin errors after start-up are logged and skipped.
    pub fn start<R, T, C>(
        config: BitTimingConfig,
        rx_pin: R,
        tx_pin: T,
        clock: C,
        options: Options,
    ) -> Result<Self, Error>
    where
        R: DigitalPin + Send + 'static,
        T: DigitalPin + Send + 'static,
        C: Clock + Clone + Send + 'static,
    {
        Self::launch(config, rx_pin, tx_pin, clock, options).map_err(|e| {
            error!("Software UART: {}", e);
            e
        })
    }

    fn launch<R, T, C>(
        config: BitTimingConfig,
        mut rx_pin: R,
        tx_pin: T,
        clock: C,
        options: Options,
    ) -> Result<Self, Error>
    where
        R: DigitalPin + Send + 'static,
        T: DigitalPin + Send + 'static,
        C: Clock + Clone + Send + 'static,
    {
        rx_pin.export().context(RxPinSnafu)?;
        rx_pin.set_direction(Direction::In).context(RxPinSnafu)?;
        let initial = rx_pin.read().context(RxPinSnafu)?;

        let mut transmitter = Transmitter::new(config, tx_pin, clock.clone());
        transmitter.idle().context(TxPinSnafu)?;

        let mut uart = Self {
            config,
            rx: Arc::new(RingBuffer::new(options.buffer_capacity)),
            tx: Arc::new(RingBuffer::new(options.buffer_capacity)),
            running: Arc::new(AtomicBool::new(true)),
            threads: Vec::new(),
        };

        let tx = uart.tx.clone();
        let running = uart.running.clone();
        uart.spawn("tx", move || {
            transmitter.run(&tx, &running);
            let mut pin = transmitter.into_pin();
            if let Err(e) = pin.unexport() {
                warn!("Software UART: {}", e);
            }
        })?;

        match options.rx_mode {
            RxMode::Scoring => uart.start_scoring_rx(rx_pin, clock, initial, options)?,
            RxMode::Polling { oversampling } => {
                let mut receiver = PollingReceiver::new(config, oversampling);
                let mut timer = BitTimer::new(clock);
                let rx = uart.rx.clone();
                let running = uart.running.clone();
                uart.spawn("rx", move || {
                    receiver.run(&mut rx_pin, &mut timer, &mut &*rx, &running);
                    if let Err(e) = rx_pin.unexport() {
                        warn!("Software UART: {}", e);
                    }
                })?;
            }
        }

        info!("Software UART started, {}", config);
        Ok(uart)
    }

    fn start_scoring_rx<R, C>(
        &mut self,
        mut rx_pin: R,
        clock: C,
        initial: Level,
        options: Options,
    ) -> Result<(), Error>
    where
        R: DigitalPin + Send + 'static,
        C: Clock + Clone + Send + 'static,
    {
        let config = self.config;
        let queue = Arc::new(SpanQueue::new(options.span_queue_capacity));

        let mut capture = EdgeCapture::new(&config, queue.clone(), clock.now(), initial);
        let running = self.running.clone();
        self.spawn("rx-edges", move || {
            let mut read_failed = false;
            while running.load(Ordering::SeqCst) {
                let now = clock.now();
                match rx_pin.read() {
                    Ok(level) => {
                        read_failed = false;
                        capture.sample(now, level);
                    }
                    Err(e) => {
                        if !read_failed {
                            warn!("Software UART: rx pin read failed: {}", e);
                        }
                        read_failed = true;
                        capture.check_idle(now);
                    }
                }
                thread::yield_now();
            }
            if let Err(e) = rx_pin.unexport() {
                warn!("Software UART: {}", e);
            }
        })?;

        let mut decoder = SpanDecoder::new(config);
        let rx = self.rx.clone();
        let running = self.running.clone();
        self.spawn("rx-decode", move || {
            let mut sink = &*rx;
            while running.load(Ordering::SeqCst) {
                drain_queue(&queue, &mut decoder, &mut sink);
                thread::sleep(options.decode_interval);
            }
            if queue.dropped() > 0 {
                warn!("Software UART: {} span events lost to overflow", queue.dropped());
            }
        })?;
        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, f: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let spawned = thread::Builder::new()
            .name(format!("gpio-uart-{}", name))
            .spawn(f)
            .context(SpawnSnafu { name });
        match spawned {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    /// Queue one byte for transmission. Returns false if the tx buffer is full.
    pub fn send_byte(&self, byte: u8) -> bool {
        self.tx.push_bulk(&[byte]) == 1
    }

    /// Queue as many bytes as fit in the tx buffer. Returns the number queued.
    pub fn send(&self, bytes: &[u8]) -> usize {
        self.tx.push_bulk(bytes)
    }

    pub fn receive_byte(&self) -> Option<u8> {
        self.rx.pop()
    }

    /// Move received bytes into `buf`. Returns the number moved.
    pub fn receive(&self, buf: &mut [u8]) -> usize {
        self.rx.pop_bulk(buf)
    }

    /// Number of received bytes waiting.
    pub fn available(&self) -> usize {
        self.rx.available()
    }

    /// Number of bytes still waiting to be sent.
    pub fn pending(&self) -> usize {
        self.tx.available()
    }

    pub fn config(&self) -> &BitTimingConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop and join all threads. Bytes not yet sent are discarded.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!("Software UART: thread {} panicked", name);
            }
        }
        debug!("Software UART stopped");
    }
}

impl Drop for GpioUart {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}
