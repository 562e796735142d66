//! Clocks and the absolute-deadline bit timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source, measured from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
    /// Block until `now() >= deadline`. Returns at once if the deadline has passed.
    fn sleep_until(&self, deadline: Duration);
}

/// The system monotonic clock.
///
/// Sleeps with the OS scheduler and spins for the last `spin` of each wait,
/// trading CPU for bit-edge accuracy.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    spin: Duration,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            spin: Duration::from_micros(100),
        }
    }

    pub fn with_spin(mut self, spin: Duration) -> Self {
        self.spin = spin;
        self
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&self, deadline: Duration) {
        let remaining = deadline.saturating_sub(self.now());
        if remaining > self.spin {
            thread::sleep(remaining - self.spin);
        }
        while self.now() < deadline {
            std::hint::spin_loop();
        }
    }
}

/// Virtual time for tests. Clones share the same time; sleeping simply
/// moves time forward to the deadline.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    nanos: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    fn sleep_until(&self, deadline: Duration) {
        self.nanos
            .fetch_max(deadline.as_nanos() as u64, Ordering::SeqCst);
    }
}

/// Paces bit edges against an absolute deadline, so that time spent between
/// waits doesn't accumulate as drift.
#[derive(Debug, Clone)]
pub struct BitTimer<C> {
    clock: C,
    deadline: Duration,
}

impl<C: Clock> BitTimer<C> {
    /// A timer whose deadline is the current time.
    pub fn new(clock: C) -> Self {
        let deadline = clock.now();
        Self { clock, deadline }
    }

    /// Restart from the current time, e.g. after the line has been idle.
    pub fn reset(&mut self) {
        self.deadline = self.clock.now();
    }

    /// Move the deadline `hold` forward and sleep until it is reached.
    pub fn wait(&mut self, hold: Duration) {
        self.deadline += hold;
        self.clock.sleep_until(self.deadline);
    }

    /// Move the deadline back, without sleeping.
    pub fn rewind(&mut self, by: Duration) {
        self.deadline = self.deadline.saturating_sub(by);
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}
