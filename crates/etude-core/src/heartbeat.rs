// src/heartbeat.rs
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::conn::ConnHandle;

/// Time-ordered multimap of liveness deadlines.
pub struct HeartbeatRegistry {
    entries: Mutex<BTreeMap<Instant, Vec<ConnHandle>>>,
    wait: Duration,
    /// Sliding mode re-enrolls expired entries with a fresh deadline.
    sliding: bool,
}

impl HeartbeatRegistry {
    pub fn new(wait: Duration, sliding: bool) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            wait,
            sliding,
        }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Enroll `handle` with deadline `now + wait`.
    pub fn add(&self, handle: ConnHandle, now: Instant) {
        self.entries
            .lock()
            .entry(now + self.wait)
            .or_default()
            .push(handle);
    }

    /// Drop the entries of one tenure. A newer tenure of the same slot keeps
    /// its own.
    pub fn remove(&self, handle: ConnHandle) {
        self.entries.lock().retain(|_, handles| {
            handles.retain(|h| *h != handle);
            !handles.is_empty()
        });
    }

    /// Pop every entry due at or before `now`. In sliding mode each one is
    /// re-enrolled for `now + wait` before being returned.
    pub fn expired(&self, now: Instant) -> Vec<ConnHandle> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        while let Some(entry) = entries.first_entry() {
            if *entry.key() > now {
                break;
            }
            due.extend(entry.remove());
        }
        if self.sliding && !due.is_empty() {
            entries.entry(now + self.wait).or_default().extend(due.iter().copied());
        }
        due
    }

    pub fn earliest(&self) -> Option<Instant> {
        self.entries.lock().keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Eviction decision for an expired entry.
///
/// `timeout_kick` evicts at the first deadline. Otherwise a peer is evicted
/// only after `3 * wait + grace` without a heartbeat.
pub fn should_kick(last_ping: Instant, now: Instant, wait: Duration, grace: Duration, timeout_kick: bool) -> bool {
    if timeout_kick {
        return true;
    }
    now.saturating_duration_since(last_ping) > wait * 3 + grace
}
