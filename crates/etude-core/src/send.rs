//! Outbound path: a global send queue drained by a single sender thread.
//!
//! The sender writes as much as the socket accepts. A remainder is parked on
//! the connection and finished by the event loop's write handler once the
//! socket turns writable; completion posts the sender so messages held back
//! behind the parked buffer go out in order.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::conn::{ConnHandle, Connection, WriteHandler};
use crate::event_loop::{Interest, Poller};
use crate::memory::MessageBuf;
use crate::metrics::EngineMetrics;
use crate::syscalls::{self, SendOutcome};

/// An encoded packet addressed to one connection tenure.
#[derive(Debug)]
pub struct OutboundMessage {
    pub handle: ConnHandle,
    pub conn: Arc<Connection>,
    pub buf: MessageBuf,
}

/// A buffer plus how much of it has reached the socket.
#[derive(Debug)]
pub struct OutboundBuf {
    buf: MessageBuf,
    sent: usize,
}

#[derive(Debug)]
pub enum WriteProgress {
    Done,
    /// The socket stopped accepting bytes; the rest is still owed.
    Partial,
    Failed(io::Error),
}

impl OutboundBuf {
    pub fn new(buf: MessageBuf) -> Self {
        Self { buf, sent: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.sent
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Push unsent bytes through `write` until done, blocked or failed.
    /// Each byte is handed to `write` exactly once across calls.
    pub fn write_to<F>(&mut self, mut write: F) -> WriteProgress
    where
        F: FnMut(&[u8]) -> io::Result<SendOutcome>,
    {
        while self.sent < self.buf.len() {
            match write(&self.buf[self.sent..]) {
                Ok(SendOutcome::Sent(0)) | Ok(SendOutcome::WouldBlock) => return WriteProgress::Partial,
                Ok(SendOutcome::Sent(n)) => self.sent += n.min(self.remaining()),
                Err(err) => return WriteProgress::Failed(err),
            }
        }
        WriteProgress::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The global queue is over its cap; the message was dropped.
    QueueFull,
    /// This connection has too many messages waiting; drop and kick it.
    ConnectionBacklogged,
    /// The addressed tenure already ended; the message was dropped.
    Stale,
}

struct QueueState {
    items: VecDeque<OutboundMessage>,
    permits: usize,
    shutdown: bool,
}

pub struct SendQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    len: AtomicUsize,
    max_total: usize,
    max_per_conn: usize,
}

impl SendQueue {
    pub fn new(max_total: usize, max_per_conn: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                permits: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            len: AtomicUsize::new(0),
            max_total,
            max_per_conn,
        }
    }

    pub fn push(&self, msg: OutboundMessage) -> Enqueue {
        // a late reply must not count against the slot's next tenure
        if !msg.conn.is_current(&msg.handle) {
            return Enqueue::Stale;
        }
        if self.len.load(Ordering::Acquire) > self.max_total {
            return Enqueue::QueueFull;
        }
        if msg.conn.pending_sends() > self.max_per_conn {
            return Enqueue::ConnectionBacklogged;
        }

        msg.conn.inc_pending_sends();
        let mut state = self.state.lock();
        state.items.push_back(msg);
        state.permits += 1;
        self.len.fetch_add(1, Ordering::AcqRel);
        drop(state);
        self.cond.notify_one();
        Enqueue::Queued
    }

    /// Wake the sender without adding a message (a parked write finished).
    pub fn post(&self) {
        self.state.lock().permits += 1;
        self.cond.notify_one();
    }

    /// Block until there is something to do, then take the whole queue.
    /// Returns `None` once shut down.
    pub fn wait_batch(&self) -> Option<VecDeque<OutboundMessage>> {
        let mut state = self.state.lock();
        while state.permits == 0 && !state.shutdown {
            self.cond.wait(&mut state);
        }
        if state.shutdown {
            return None;
        }
        state.permits = 0;
        let batch = std::mem::take(&mut state.items);
        self.len.fetch_sub(batch.len(), Ordering::AcqRel);
        Some(batch)
    }

    /// Put held-back messages in front of anything queued since.
    pub fn requeue_front(&self, mut held: VecDeque<OutboundMessage>) {
        if held.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        self.len.fetch_add(held.len(), Ordering::AcqRel);
        held.append(&mut state.items);
        state.items = held;
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Drop everything still queued. Returns how many messages were freed.
    pub fn clear(&self) -> usize {
        let items = std::mem::take(&mut self.state.lock().items);
        self.len.fetch_sub(items.len(), Ordering::AcqRel);
        items.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One pass of the sender over a drained batch. Messages whose connection
/// still has a parked write are returned so they can be requeued in order.
pub(crate) fn send_batch(
    batch: VecDeque<OutboundMessage>,
    poller: &Poller,
    metrics: &EngineMetrics,
) -> VecDeque<OutboundMessage> {
    send_batch_with(batch, poller, metrics, syscalls::send_nonblocking)
}

fn send_batch_with<W>(
    batch: VecDeque<OutboundMessage>,
    poller: &Poller,
    metrics: &EngineMetrics,
    mut write: W,
) -> VecDeque<OutboundMessage>
where
    W: FnMut(RawFd, &[u8]) -> io::Result<SendOutcome>,
{
    let mut held = VecDeque::new();
    // Once one message for a slot is held, every later one in the batch is
    // too, even if the parked write completes in between.
    let mut blocked = HashSet::new();
    for msg in batch {
        let conn = Arc::clone(&msg.conn);
        let mut send = conn.lock_send();
        if !conn.is_current(&msg.handle) {
            continue;
        }
        if send.in_flight > 0 || blocked.contains(&conn.index()) {
            drop(send);
            blocked.insert(conn.index());
            held.push_back(msg);
            continue;
        }
        conn.dec_pending_sends();

        let fd = conn.fd();
        let mut out = OutboundBuf::new(msg.buf);
        let before = out.remaining();
        let progress = out.write_to(|bytes| write(fd, bytes));
        metrics.add_bytes(before - out.remaining());

        match progress {
            WriteProgress::Done => {}
            WriteProgress::Partial => {
                send.parked = Some(out);
                send.in_flight += 1;
                conn.set_write_handler(WriteHandler::Send);
                if let Err(err) = poller.reregister(fd, Interest::READ_WRITE, msg.handle) {
                    warn!(fd, error = %err, "failed to arm writable interest");
                }
            }
            WriteProgress::Failed(err) => {
                // the read side notices the broken socket and closes it
                debug!(fd, error = %err, "send failed, dropping message");
            }
        }
    }
    held
}

/// Writable event: continue the parked buffer. Returns true when the parked
/// write finished (successfully or not) and the sender should be posted.
pub(crate) fn continue_parked(
    conn: &Connection,
    handle: ConnHandle,
    poller: &Poller,
    metrics: &EngineMetrics,
) -> bool {
    let mut send = conn.lock_send();
    if !conn.is_current(&handle) {
        return false;
    }
    let Some(mut out) = send.parked.take() else {
        return false;
    };

    let fd = conn.fd();
    let before = out.remaining();
    let progress = out.write_to(|bytes| syscalls::send_nonblocking(fd, bytes));
    metrics.add_bytes(before - out.remaining());

    if let WriteProgress::Partial = progress {
        send.parked = Some(out);
        return false;
    }
    if let WriteProgress::Failed(err) = progress {
        debug!(fd, error = %err, "continued send failed");
    }

    send.in_flight = send.in_flight.saturating_sub(1);
    conn.set_write_handler(WriteHandler::Idle);
    if let Err(err) = poller.reregister(fd, Interest::READ, handle) {
        warn!(fd, error = %err, "failed to disarm writable interest");
    }
    true
}
