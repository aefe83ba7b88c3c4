// src/pool.rs
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::conn::{ConnHandle, Connection, SlotState};
use crate::error::{EngineError, EngineResult};
use crate::memory::Memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub active: usize,
    pub pending: usize,
}

struct Lists {
    free: Vec<usize>,
    states: Vec<SlotState>,
    active: usize,
    pending: usize,
}

impl Lists {
    fn move_to(&mut self, index: usize, to: SlotState) {
        match std::mem::replace(&mut self.states[index], to) {
            SlotState::Active => self.active -= 1,
            SlotState::PendingRecycle => self.pending -= 1,
            SlotState::Free => {}
        }
        match to {
            SlotState::Active => self.active += 1,
            SlotState::PendingRecycle => self.pending += 1,
            SlotState::Free => self.free.push(index),
        }
    }
}

/// Arena of pooled connections addressed by index.
///
/// Slots never move or shrink, so an index stays valid for the life of the
/// pool; [`ConnHandle::generation`] tells tenures of the same slot apart.
/// Lock order is recycle → lists → slots. No connection lock is ever held
/// while one of these is taken.
pub struct ConnectionPool {
    slots: RwLock<Vec<Arc<Connection>>>,
    lists: Mutex<Lists>,
    recycle: Mutex<VecDeque<(usize, Instant)>>,
    elastic: bool,
    memory: Arc<Memory>,
    max_packet_len: usize,
}

impl ConnectionPool {
    /// Pre-allocate `capacity` slots. An elastic pool grows past that on demand.
    pub fn new(capacity: usize, elastic: bool, memory: Arc<Memory>, max_packet_len: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Arc::new(Connection::new(i, Arc::clone(&memory), max_packet_len)))
            .collect();
        // pop() hands out the lowest index first
        let free = (0..capacity).rev().collect();

        Self {
            slots: RwLock::new(slots),
            lists: Mutex::new(Lists {
                free,
                states: vec![SlotState::Free; capacity],
                active: 0,
                pending: 0,
            }),
            recycle: Mutex::new(VecDeque::new()),
            elastic,
            memory,
            max_packet_len,
        }
    }

    /// Take a free slot (or grow) and bind `fd` to it.
    pub fn acquire(&self, fd: RawFd) -> EngineResult<(ConnHandle, Arc<Connection>)> {
        let index = {
            let mut lists = self.lists.lock();
            let index = match lists.free.pop() {
                Some(index) => index,
                None if self.elastic => self.grow(&mut lists),
                None => return Err(EngineError::PoolExhausted(lists.states.len())),
            };
            lists.move_to(index, SlotState::Active);
            index
        };

        let conn = Arc::clone(&self.slots.read()[index]);
        let handle = conn.bind(fd);
        Ok((handle, conn))
    }

    fn grow(&self, lists: &mut Lists) -> usize {
        let mut slots = self.slots.write();
        let index = slots.len();
        slots.push(Arc::new(Connection::new(
            index,
            Arc::clone(&self.memory),
            self.max_packet_len,
        )));
        lists.states.push(SlotState::Free);
        index
    }

    /// Immediate release. Returns the fd to close, or `None` for a stale handle.
    pub fn release(&self, handle: ConnHandle) -> Option<RawFd> {
        let fd = self.get(handle.index)?.retire(handle.generation)?;
        self.lists.lock().move_to(handle.index, SlotState::Free);
        Some(fd)
    }

    /// Retire the slot now and park it until [`reap`](Self::reap) sees its
    /// recycle window elapse. Returns the fd to close.
    pub fn deferred_release(&self, handle: ConnHandle, now: Instant) -> Option<RawFd> {
        let fd = self.get(handle.index)?.retire(handle.generation)?;
        let mut recycle = self.recycle.lock();
        self.lists
            .lock()
            .move_to(handle.index, SlotState::PendingRecycle);
        recycle.push_back((handle.index, now));
        Some(fd)
    }

    /// Return pending slots whose window has elapsed to the free list.
    /// `force` ignores the window. Returns how many slots were freed.
    pub fn reap(&self, now: Instant, wait: Duration, force: bool) -> usize {
        let mut recycle = self.recycle.lock();
        let mut lists = self.lists.lock();
        let mut freed = 0;
        while let Some(&(index, stamp)) = recycle.front() {
            if !force && now.saturating_duration_since(stamp) < wait {
                break;
            }
            recycle.pop_front();
            lists.move_to(index, SlotState::Free);
            freed += 1;
        }
        freed
    }

    pub fn stats(&self) -> PoolStats {
        let _recycle = self.recycle.lock();
        let lists = self.lists.lock();
        PoolStats {
            total: lists.states.len(),
            free: lists.free.len(),
            active: lists.active,
            pending: lists.pending,
        }
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.lists.lock().states.get(index).copied()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Connection>> {
        self.slots.read().get(index).cloned()
    }

    /// The connection behind `handle`, if that tenure is still live.
    pub fn resolve(&self, handle: ConnHandle) -> Option<Arc<Connection>> {
        self.get(handle.index).filter(|c| c.is_current(&handle))
    }

    /// Every live handle, for shutdown sweeps.
    pub fn live_handles(&self) -> Vec<ConnHandle> {
        self.slots
            .read()
            .iter()
            .filter_map(|conn| conn.handle())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MAX_PACKET_LEN;

    fn pool(capacity: usize, elastic: bool) -> ConnectionPool {
        ConnectionPool::new(capacity, elastic, Memory::new(), MAX_PACKET_LEN)
    }

    fn assert_balanced(pool: &ConnectionPool) {
        let s = pool.stats();
        assert_eq!(s.free + s.active + s.pending, s.total, "{s:?}");
    }

    #[test]
    fn test_pool_operations() {
        let pool = pool(10, false);
        assert_eq!(pool.stats().total, 10);

        let (h1, c1) = pool.acquire(100).unwrap();
        assert_eq!(h1.index, 0);
        assert_eq!(c1.fd(), 100);
        let (h2, _) = pool.acquire(101).unwrap();
        assert_eq!(h2.index, 1);

        assert_eq!(pool.release(h1), Some(100));
        assert_eq!(pool.stats().active, 1);

        // index 0 went back to the head of the free list
        let (h3, _) = pool.acquire(102).unwrap();
        assert_eq!(h3.index, 0);
        assert_ne!(h3.generation, h1.generation);
        assert_balanced(&pool);
    }

    #[test]
    fn fixed_pool_of_two_rejects_the_third() {
        let pool = pool(2, false);
        pool.acquire(10).unwrap();
        pool.acquire(11).unwrap();
        let err = pool.acquire(12).unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted(2)));
        assert_balanced(&pool);
    }

    #[test]
    fn elastic_pool_of_two_grows_for_the_third() {
        let pool = pool(2, true);
        pool.acquire(10).unwrap();
        pool.acquire(11).unwrap();
        let (h, _) = pool.acquire(12).unwrap();
        assert_eq!(h.index, 2);
        let s = pool.stats();
        assert_eq!((s.total, s.active, s.free), (3, 3, 0));
    }

    #[test]
    fn stale_release_is_a_no_op() {
        let pool = pool(2, false);
        let (h, _) = pool.acquire(10).unwrap();
        assert!(pool.release(h).is_some());
        assert!(pool.release(h).is_none());
        assert!(pool.deferred_release(h, Instant::now()).is_none());
        assert_eq!(pool.stats().free, 2);
        assert_balanced(&pool);
    }

    #[test]
    fn deferred_slots_wait_for_the_recycle_window() {
        let pool = pool(4, false);
        let t0 = Instant::now();
        let (h, conn) = pool.acquire(10).unwrap();
        assert_eq!(pool.deferred_release(h, t0), Some(10));
        assert_eq!(pool.slot_state(h.index), Some(SlotState::PendingRecycle));
        assert!(pool.resolve(h).is_none());
        assert_eq!(conn.generation() & 1, 0);
        assert_balanced(&pool);

        let wait = Duration::from_secs(60);
        assert_eq!(pool.reap(t0 + Duration::from_secs(59), wait, false), 0);
        assert_eq!(pool.stats().pending, 1);
        assert_eq!(pool.reap(t0 + Duration::from_secs(60), wait, false), 1);
        assert_eq!(pool.slot_state(h.index), Some(SlotState::Free));
        assert_balanced(&pool);
    }

    #[test]
    fn forced_reap_drains_everything() {
        let pool = pool(4, false);
        let now = Instant::now();
        for fd in 0..3 {
            let (h, _) = pool.acquire(fd).unwrap();
            pool.deferred_release(h, now);
        }
        assert_eq!(pool.reap(now, Duration::from_secs(3600), true), 3);
        let s = pool.stats();
        assert_eq!((s.free, s.pending, s.active), (4, 0, 0));
    }

    #[test]
    fn acquire_release_cycles_never_grow_an_elastic_pool() {
        let pool = pool(3, true);
        for fd in 0..1000 {
            let (h, _) = pool.acquire(fd).unwrap();
            assert!(pool.release(h).is_some());
            let s = pool.stats();
            assert_eq!(s.total, 3, "cycle {fd}");
            assert_eq!(s.free + s.active + s.pending, s.total, "cycle {fd}");
        }
    }

    #[test]
    fn concurrent_churn_never_leaks_a_slot() {
        let pool = Arc::new(pool(8, true));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let (h, _) = pool.acquire(t * 1000 + i).unwrap();
                        if i % 2 == 0 {
                            pool.release(h);
                        } else {
                            pool.deferred_release(h, Instant::now());
                            pool.reap(Instant::now(), Duration::ZERO, false);
                        }
                        assert_balanced(&pool);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        pool.reap(Instant::now(), Duration::ZERO, true);
        let s = pool.stats();
        assert_eq!(s.active, 0);
        assert_eq!(s.pending, 0);
        assert_eq!(s.free, s.total);
    }

    #[test]
    fn live_handles_skip_free_slots() {
        let pool = pool(3, false);
        let (a, _) = pool.acquire(1).unwrap();
        let (b, _) = pool.acquire(2).unwrap();
        pool.release(a);
        assert_eq!(pool.live_handles(), vec![b]);
    }
}
