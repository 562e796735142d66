//! Fixed-capacity byte FIFO shared between a UART thread and the application.

use parking_lot::{Mutex, MutexGuard};

/// Destination for received bytes.
pub trait ByteSink {
    fn put(&mut self, byte: u8);
}

impl ByteSink for Vec<u8> {
    fn put(&mut self, byte: u8) {
        self.push(byte);
    }
}

impl ByteSink for &RingBuffer {
    fn put(&mut self, byte: u8) {
        self.push(byte);
    }
}

#[derive(Debug)]
struct Inner {
    data: Box<[u8]>,
    start: usize,
    tail: usize,
    full: bool,
}

impl Inner {
    fn available(&self) -> usize {
        if self.full {
            self.data.len()
        } else if self.tail >= self.start {
            self.tail - self.start
        } else {
            self.data.len() - self.start + self.tail
        }
    }

    fn advance(&self, index: usize) -> usize {
        (index + 1) % self.data.len()
    }
}

/// A circular byte buffer. Every operation takes an internal lock, so one
/// producer and one consumer may use it concurrently through a shared reference.
///
/// [`push()`](Self::push) overwrites the oldest byte when the buffer is full,
/// [`push_bulk()`](Self::push_bulk) never does.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

impl RingBuffer {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                data: vec![0; capacity].into_boxed_slice(),
                start: 0,
                tail: 0,
                full: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Append a byte, dropping the oldest one if the buffer is full.
    pub fn push(&self, byte: u8) {
        let mut inner = self.lock();
        let tail = inner.tail;
        inner.data[tail] = byte;
        inner.tail = inner.advance(tail);
        if inner.full {
            inner.start = inner.tail;
        } else {
            inner.full = inner.tail == inner.start;
        }
    }

    /// Append as many bytes as fit without overwriting. Returns the number appended.
    pub fn push_bulk(&self, bytes: &[u8]) -> usize {
        let mut inner = self.lock();
        let count = bytes.len().min(inner.data.len() - inner.available());
        for &byte in &bytes[..count] {
            let tail = inner.tail;
            inner.data[tail] = byte;
            inner.tail = inner.advance(tail);
        }
        if count > 0 && inner.tail == inner.start {
            inner.full = true;
        }
        count
    }

    /// Remove the oldest byte.
    pub fn pop(&self) -> Option<u8> {
        let mut inner = self.lock();
        if inner.available() == 0 {
            return None;
        }
        let byte = inner.data[inner.start];
        inner.start = inner.advance(inner.start);
        inner.full = false;
        Some(byte)
    }

    /// Move up to `out.len()` of the oldest bytes into `out`. Returns the number moved.
    pub fn pop_bulk(&self, out: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let count = out.len().min(inner.available());
        for slot in &mut out[..count] {
            *slot = inner.data[inner.start];
            inner.start = inner.advance(inner.start);
        }
        if count > 0 {
            inner.full = false;
        }
        count
    }

    /// Number of bytes waiting to be popped.
    pub fn available(&self) -> usize {
        self.lock().available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }
}
