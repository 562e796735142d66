//! Lock-free hand-off from the edge watcher to the span decoder.
//!
//! The edge watcher must never block. When the decoder falls behind, the
//! oldest event is dropped.

use crossbeam::queue::ArrayQueue;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::BitSpan;

/// What the edge watcher reports to the decoder, in line order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// A completed span, ended by an edge.
    Span(BitSpan),
    /// The line has been idle long enough that every pending frame is complete.
    Idle,
}

/// Bounded queue of [`RxEvent`]s with drop-oldest overflow.
#[derive(Debug)]
pub struct SpanQueue {
    events: ArrayQueue<RxEvent>,
    dropped: AtomicUsize,
}

impl SpanQueue {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "SpanQueue capacity must be non-zero");
        Self {
            events: ArrayQueue::new(capacity),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Producer side. Never blocks.
    pub fn push(&self, event: RxEvent) {
        if self.events.force_push(event).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn push_span(&self, span: BitSpan) {
        self.push(RxEvent::Span(span));
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<RxEvent> {
        self.events.pop()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    /// Number of events lost to overflow so far.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Level;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn span(n: u64) -> RxEvent {
        RxEvent::Span(BitSpan::new(
            Duration::from_nanos(n),
            Level::from(n % 2 == 0),
        ))
    }

    fn nanos(event: RxEvent) -> u64 {
        match event {
            RxEvent::Span(s) => s.duration.as_nanos() as u64,
            RxEvent::Idle => panic!("unexpected idle event"),
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let q = SpanQueue::new(3);
        assert_eq!(q.capacity(), 3);
        for n in 1..=4 {
            q.push(span(n));
        }
        q.push(RxEvent::Idle);
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.pop(), Some(span(3)));
        assert_eq!(q.pop(), Some(span(4)));
        assert_eq!(q.pop(), Some(RxEvent::Idle));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_concurrent_order() {
        let q = Arc::new(SpanQueue::new(8));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                for n in 1..=20_000 {
                    q.push(span(n));
                }
            })
        };
        let mut last = 0;
        let mut received = 0;
        loop {
            match q.pop() {
                Some(event) => {
                    let n = nanos(event);
                    assert!(n > last, "spans out of order: {} after {}", n, last);
                    assert_eq!(event, span(n));
                    last = n;
                    received += 1;
                }
                None if producer.is_finished() && q.is_empty() => break,
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(received + q.dropped(), 20_000);
    }
}
