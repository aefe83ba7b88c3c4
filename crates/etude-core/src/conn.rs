// src/conn.rs
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::framing::FrameAssembler;
use crate::memory::Memory;
use crate::send::OutboundBuf;

/// Sentinel stored in `fd` while the slot holds no socket.
pub const INVALID_FD: RawFd = -1;

/// Index + generation snapshot identifying one tenure of a pooled slot.
///
/// A handle is stale once the slot has been retired; every path that acts on
/// a connection compares the snapshot against [`Connection::generation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    pub index: usize,
    pub generation: u64,
}

impl ConnHandle {
    /// Epoll token: slot index in the high half, low 32 bits of the generation
    /// in the low half.
    #[inline]
    pub fn token(&self) -> u64 {
        ((self.index as u64) << 32) | (self.generation & 0xFFFF_FFFF)
    }

    #[inline]
    pub fn split_token(token: u64) -> (usize, u32) {
        ((token >> 32) as usize, token as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadHandler {
    Accept,
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHandler {
    Idle,
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Free,
    Active,
    PendingRecycle,
}

/// Outbound bookkeeping, guarded by the connection's send lock.
#[derive(Debug, Default)]
pub struct SendState {
    /// Buffer left over from a partial write, continued by the write handler.
    pub parked: Option<OutboundBuf>,
    /// Non-zero while writable interest is registered for `parked`.
    pub in_flight: u32,
}

#[derive(Debug)]
struct Liveness {
    last_ping: Instant,
    flood_last: Option<Instant>,
    flood_count: u32,
}

impl Liveness {
    fn fresh(now: Instant) -> Self {
        Self {
            last_ping: now,
            flood_last: None,
            flood_count: 0,
        }
    }
}

#[derive(Debug)]
struct Meta {
    read_handler: ReadHandler,
    write_handler: WriteHandler,
    peer: Option<SocketAddr>,
    listen_port: Option<u16>,
}

impl Meta {
    const EMPTY: Meta = Meta {
        read_handler: ReadHandler::Request,
        write_handler: WriteHandler::Idle,
        peer: None,
        listen_port: None,
    };
}

// 64-byte aligned so neighbouring slots never share a cache line
#[repr(C, align(64))]
pub struct Connection {
    index: usize,
    fd: AtomicI32,
    generation: AtomicU64,
    pending_sends: AtomicUsize,
    recv: Mutex<FrameAssembler>,
    send: Mutex<SendState>,
    liveness: Mutex<Liveness>,
    logic: Mutex<()>,
    meta: Mutex<Meta>,
}

impl Connection {
    pub fn new(index: usize, memory: Arc<Memory>, max_packet_len: usize) -> Self {
        Self {
            index,
            fd: AtomicI32::new(INVALID_FD),
            generation: AtomicU64::new(0),
            pending_sends: AtomicUsize::new(0),
            recv: Mutex::new(FrameAssembler::new(memory, max_packet_len)),
            send: Mutex::new(SendState::default()),
            liveness: Mutex::new(Liveness::fresh(Instant::now())),
            logic: Mutex::new(()),
            meta: Mutex::new(Meta::EMPTY),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_current(&self, handle: &ConnHandle) -> bool {
        handle.index == self.index && self.generation() == handle.generation
    }

    /// Current handle if the slot is live.
    pub fn handle(&self) -> Option<ConnHandle> {
        let generation = self.generation();
        (generation & 1 == 1).then_some(ConnHandle {
            index: self.index,
            generation,
        })
    }

    /// Start a new tenure on `fd`. The slot must be free (even generation).
    pub(crate) fn bind(&self, fd: RawFd) -> ConnHandle {
        *self.liveness.lock() = Liveness::fresh(Instant::now());
        *self.meta.lock() = Meta::EMPTY;
        self.pending_sends.store(0, Ordering::Release);
        self.fd.store(fd, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(generation & 1 == 1, "bound a slot that was never retired");
        ConnHandle {
            index: self.index,
            generation,
        }
    }

    /// End the tenure identified by `expected`, returning the fd the caller
    /// must close. Returns `None` if the tenure already ended.
    ///
    /// Runs under the recv and send locks so neither path can observe the fd
    /// after it is handed back.
    pub(crate) fn retire(&self, expected: u64) -> Option<RawFd> {
        let mut recv = self.recv.lock();
        let mut send = self.send.lock();
        self.generation
            .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        recv.reset();
        send.parked = None;
        send.in_flight = 0;
        self.pending_sends.store(0, Ordering::Release);
        Some(self.fd.swap(INVALID_FD, Ordering::AcqRel))
    }

    pub(crate) fn lock_recv(&self) -> MutexGuard<'_, FrameAssembler> {
        self.recv.lock()
    }

    pub(crate) fn lock_send(&self) -> MutexGuard<'_, SendState> {
        self.send.lock()
    }

    /// Serializes business handlers for this connection.
    pub(crate) fn lock_logic(&self) -> MutexGuard<'_, ()> {
        self.logic.lock()
    }

    pub fn read_handler(&self) -> ReadHandler {
        self.meta.lock().read_handler
    }

    pub fn write_handler(&self) -> WriteHandler {
        self.meta.lock().write_handler
    }

    pub(crate) fn set_write_handler(&self, handler: WriteHandler) {
        self.meta.lock().write_handler = handler;
    }

    pub(crate) fn mark_listener(&self, port: u16) {
        let mut meta = self.meta.lock();
        meta.read_handler = ReadHandler::Accept;
        meta.listen_port = Some(port);
    }

    pub(crate) fn set_peer(&self, peer: SocketAddr) {
        self.meta.lock().peer = Some(peer);
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.meta.lock().peer
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.meta.lock().listen_port
    }

    pub fn touch_ping(&self, now: Instant) {
        self.liveness.lock().last_ping = now;
    }

    pub fn last_ping(&self) -> Instant {
        self.liveness.lock().last_ping
    }

    /// Record a completed frame at `now`. Returns true once `kick_count`
    /// frames have arrived back to back within `interval` of each other.
    pub fn check_flood(&self, now: Instant, interval: Duration, kick_count: u32) -> bool {
        let mut live = self.liveness.lock();
        match live.flood_last {
            Some(last) if now.saturating_duration_since(last) < interval => live.flood_count += 1,
            _ => live.flood_count = 0,
        }
        live.flood_last = Some(now);
        if live.flood_count >= kick_count {
            live.flood_count = 0;
            return true;
        }
        false
    }

    pub fn pending_sends(&self) -> usize {
        self.pending_sends.load(Ordering::Acquire)
    }

    pub(crate) fn inc_pending_sends(&self) -> usize {
        self.pending_sends.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn dec_pending_sends(&self) {
        let _ = self
            .pending_sends
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("fd", &self.fd())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(3, Memory::new(), crate::packet::MAX_PACKET_LEN)
    }

    #[test]
    fn verify_conn_alignment() {
        assert_eq!(std::mem::align_of::<Connection>(), 64);
        assert_eq!(std::mem::size_of::<Connection>() % 64, 0);
    }

    #[test]
    fn generation_is_odd_while_bound() {
        let c = conn();
        assert!(c.handle().is_none());

        let h = c.bind(42);
        assert_eq!(h.generation, 1);
        assert_eq!(c.fd(), 42);
        assert!(c.is_current(&h));
        assert_eq!(c.handle(), Some(h));

        assert_eq!(c.retire(h.generation), Some(42));
        assert_eq!(c.fd(), INVALID_FD);
        assert!(!c.is_current(&h));
        assert_eq!(c.generation(), 2);
    }

    #[test]
    fn retiring_a_stale_handle_is_a_no_op() {
        let c = conn();
        let old = c.bind(7);
        assert!(c.retire(old.generation).is_some());
        let new = c.bind(8);
        assert_eq!(c.retire(old.generation), None);
        assert_eq!(c.fd(), 8);
        assert!(c.is_current(&new));
    }

    #[test]
    fn token_carries_index_and_low_generation_bits() {
        let h = ConnHandle {
            index: 9,
            generation: (1 << 40) | 5,
        };
        assert_eq!(ConnHandle::split_token(h.token()), (9, 5));
    }

    #[test]
    fn flood_counter_trips_on_rapid_frames() {
        let c = conn();
        c.bind(1);
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        // first frame only arms the window
        assert!(!c.check_flood(start, interval, 3));
        assert!(!c.check_flood(start + Duration::from_millis(10), interval, 3));
        assert!(!c.check_flood(start + Duration::from_millis(20), interval, 3));
        assert!(c.check_flood(start + Duration::from_millis(30), interval, 3));
    }

    #[test]
    fn flood_counter_resets_after_a_quiet_gap() {
        let c = conn();
        c.bind(1);
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        assert!(!c.check_flood(start, interval, 2));
        assert!(!c.check_flood(start + Duration::from_millis(10), interval, 2));
        assert!(!c.check_flood(start + Duration::from_millis(500), interval, 2));
        assert!(!c.check_flood(start + Duration::from_millis(510), interval, 2));
    }

    #[test]
    fn rebinding_resets_handlers_and_peer() {
        let c = conn();
        let h = c.bind(1);
        c.mark_listener(9000);
        c.set_write_handler(WriteHandler::Send);
        c.set_peer("127.0.0.1:5000".parse().unwrap());
        c.retire(h.generation);

        c.bind(2);
        assert_eq!(c.read_handler(), ReadHandler::Request);
        assert_eq!(c.write_handler(), WriteHandler::Idle);
        assert_eq!(c.peer_addr(), None);
        assert_eq!(c.listen_port(), None);
    }
}
