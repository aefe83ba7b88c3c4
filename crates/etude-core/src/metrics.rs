// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::pool::PoolStats;

#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub online: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
    pub frames_received: AtomicUsize,
    pub malformed_frames: AtomicUsize,
    pub flood_kicks: AtomicUsize,
    pub heartbeat_kicks: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    pub sends_discarded: AtomicUsize,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(&self) -> usize {
        self.online.load(Ordering::Relaxed)
    }

    pub fn inc_online(&self) {
        self.online.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_online(&self) {
        let _ = self
            .online
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn inc(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        CounterSnapshot {
            online: load(&self.online),
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            frames_received: load(&self.frames_received),
            malformed_frames: load(&self.malformed_frames),
            flood_kicks: load(&self.flood_kicks),
            heartbeat_kicks: load(&self.heartbeat_kicks),
            bytes_sent: load(&self.bytes_sent),
            sends_discarded: load(&self.sends_discarded),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    pub online: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub frames_received: usize,
    pub malformed_frames: usize,
    pub flood_kicks: usize,
    pub heartbeat_kicks: usize,
    pub bytes_sent: usize,
    pub sends_discarded: usize,
}

/// Point-in-time view of the engine, logged periodically.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub counters: CounterSnapshot,
    pub pool: PoolStats,
    pub max_online: usize,
    pub recv_queue_depth: usize,
    pub workers_busy: usize,
    pub send_queue_depth: usize,
    pub heartbeat_entries: usize,
    pub live_buffers: usize,
}

impl Diagnostics {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Lets a noisy log line through at most once per interval.
#[derive(Debug)]
pub struct LogThrottle {
    every: Duration,
    last: Mutex<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: Mutex::new(None),
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        if last.is_some_and(|t| now.saturating_duration_since(t) < self.every) {
            return false;
        }
        *last = Some(now);
        true
    }
}
