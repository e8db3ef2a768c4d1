use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mjpeg_relay_common::frame::{Frame, TimestampedFrame};
use serde::Serialize;
use tracing::debug;

/// Millisecond time source for buffer timestamps.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

/// Wall clock, Unix millis.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub entries: usize,
    pub bytes: usize,
    pub inserted: u64,
    pub evicted: u64,
    pub oldest_ms: Option<i64>,
    pub newest_ms: Option<i64>,
}

struct Entries {
    frames: VecDeque<TimestampedFrame>,
    /// Highest timestamp handed out; keeps time order equal to insertion order.
    last_ms: i64,
    next_seq: u64,
    bytes: usize,
    inserted: u64,
    evicted: u64,
}

/// Rolling, time-bounded window of recent frames.
///
/// Entries are ordered by capture time. Every insert evicts entries older than
/// the retention window from the front, so the buffer never holds more than
/// roughly `retention * fps` frames. Lookups binary-search the ordered entries.
pub struct FrameBuffer {
    entries: Mutex<Entries>,
    retention_ms: i64,
    clock: Arc<dyn Clock>,
}

impl FrameBuffer {
    pub fn new(retention: Duration) -> Self {
        Self::with_clock(retention, Arc::new(SystemClock))
    }

    pub fn with_clock(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries {
                frames: VecDeque::new(),
                last_ms: i64::MIN,
                next_seq: 0,
                bytes: 0,
                inserted: 0,
                evicted: 0,
            }),
            retention_ms: i64::try_from(retention.as_millis()).unwrap_or(i64::MAX),
            clock,
        }
    }

    /// Stamp `frame` with the current time, append it and evict expired entries.
    pub fn insert(&self, frame: Frame) -> TimestampedFrame {
        let mut entries = self.lock();
        let now = self.clock.now_ms().max(entries.last_ms);
        entries.last_ms = now;

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.bytes += frame.len();
        entries.inserted += 1;

        let entry = TimestampedFrame::new(frame, now, seq);
        entries.frames.push_back(entry.clone());

        let cutoff = now.saturating_sub(self.retention_ms);
        let mut evicted = 0usize;
        while entries
            .frames
            .front()
            .is_some_and(|oldest| oldest.captured_at_ms < cutoff)
        {
            if let Some(old) = entries.frames.pop_front() {
                entries.bytes -= old.frame.len();
                evicted += 1;
            }
        }
        entries.evicted += evicted as u64;

        if evicted > 0 {
            debug!(evicted, remaining = entries.frames.len(), cutoff, "evicted expired frames");
        }
        entry
    }

    /// The most recent frame captured at or before `now - offset_ms`.
    ///
    /// Never returns a frame newer than the requested instant, even when a newer
    /// one is closer to it.
    pub fn query(&self, offset_ms: u64) -> Option<TimestampedFrame> {
        let entries = self.lock();
        let now = self.clock.now_ms().max(entries.last_ms);
        let offset = i64::try_from(offset_ms).unwrap_or(i64::MAX);
        let target = now.saturating_sub(offset);

        let idx = entries
            .frames
            .partition_point(|entry| entry.captured_at_ms <= target);
        if idx == 0 {
            return None;
        }
        entries.frames.get(idx - 1).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    pub fn retention_ms(&self) -> u64 {
        self.retention_ms as u64
    }

    pub fn stats(&self) -> BufferStats {
        let entries = self.lock();
        BufferStats {
            entries: entries.frames.len(),
            bytes: entries.bytes,
            inserted: entries.inserted,
            evicted: entries.evicted,
            oldest_ms: entries.frames.front().map(|e| e.captured_at_ms),
            newest_ms: entries.frames.back().map(|e| e.captured_at_ms),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
