//! Token-bucket rate limiting and the bounded priority queue.
//!
//! Delivery consumes one token per event. When the bucket is empty,
//! events queue; when the queue is full, the lowest-priority event is
//! dropped first. Critical events are never dropped.

use super::event::{EventPriority, ProgressEvent};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket with fractional refill.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket with `burst` capacity and `rate` tokens/second.
    pub fn new(burst: u32, rate: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: rate.max(1) as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until at least one token is available.
    pub fn time_until_token(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - self.tokens;
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }

    /// Tokens currently available.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Bounded priority queue with lowest-priority-first dropping.
///
/// Orders by (priority, arrival); within a priority, FIFO. The bound is
/// soft for critical events: they are always retained.
#[derive(Debug)]
pub struct EventQueue {
    entries: BTreeMap<(EventPriority, u64), ProgressEvent>,
    max_len: usize,
    seq: u64,
    dropped: u64,
}

impl EventQueue {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_len: max_len.max(1),
            seq: 0,
            dropped: 0,
        }
    }

    /// Enqueue an event, dropping the lowest-priority entry on overflow.
    pub fn push(&mut self, event: ProgressEvent) {
        if self.entries.len() >= self.max_len && event.priority != EventPriority::Critical {
            // Reject or make room: the overall lowest-priority event loses.
            match self.entries.keys().next_back().copied() {
                Some(worst_key) if worst_key.0 > event.priority => {
                    self.entries.remove(&worst_key);
                    self.dropped += 1;
                }
                _ => {
                    self.dropped += 1;
                    return;
                }
            }
        }

        self.seq += 1;
        self.entries.insert((event.priority, self.seq), event);
    }

    /// Take the highest-priority event.
    pub fn pop(&mut self) -> Option<ProgressEvent> {
        let key = *self.entries.keys().next()?;
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything still queued, counting the events as dropped.
    pub fn clear_dropping(&mut self) {
        self.dropped += self.entries.len() as u64;
        self.entries.clear();
    }

    /// Events dropped due to overflow or forced clearing so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::event::ProgressEventType;

    fn event(priority: EventPriority, tag: u64) -> ProgressEvent {
        ProgressEvent::new(
            ProgressEventType::LogEntry,
            serde_json::json!({ "tag": tag }),
        )
        .with_priority(priority)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_burst_then_refill() {
        let mut bucket = TokenBucket::new(10, 5);
        for _ in 0..10 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());

        // 5 tokens/sec: one token after 200ms
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_caps_at_capacity() {
        let mut bucket = TokenBucket::new(10, 5);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!((bucket.available() - 10.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_token() {
        let mut bucket = TokenBucket::new(1, 5);
        assert!(bucket.try_acquire());
        let wait = bucket.time_until_token();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(200));
    }

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let mut queue = EventQueue::new(10);
        queue.push(event(EventPriority::Low, 1));
        queue.push(event(EventPriority::High, 2));
        queue.push(event(EventPriority::High, 3));
        queue.push(event(EventPriority::Critical, 4));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.payload["tag"].as_u64().unwrap())
            .collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_overflow_drops_lowest_priority() {
        let mut queue = EventQueue::new(2);
        queue.push(event(EventPriority::Low, 1));
        queue.push(event(EventPriority::Medium, 2));
        queue.push(event(EventPriority::High, 3));

        assert_eq!(queue.dropped_count(), 1);
        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.payload["tag"].as_u64().unwrap())
            .collect();
        // The low-priority event was evicted
        assert_eq!(order, vec![3, 2]);
    }

    #[test]
    fn test_overflow_rejects_incoming_when_lowest() {
        let mut queue = EventQueue::new(2);
        queue.push(event(EventPriority::High, 1));
        queue.push(event(EventPriority::High, 2));
        queue.push(event(EventPriority::Low, 3));

        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_critical_never_dropped() {
        let mut queue = EventQueue::new(2);
        queue.push(event(EventPriority::Critical, 1));
        queue.push(event(EventPriority::Critical, 2));
        queue.push(event(EventPriority::Critical, 3));

        assert_eq!(queue.dropped_count(), 0);
        assert_eq!(queue.len(), 3);
    }
}
