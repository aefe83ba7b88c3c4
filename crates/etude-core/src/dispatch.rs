//! Message-code dispatch for completed frames.
//!
//! Business logic plugs in through [`MessageHandler`], registered per code on
//! a [`Dispatcher`]. Handlers run on worker threads and answer through the
//! [`Session`] they are given.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::checksum::{Checksum, Crc32};
use crate::conn::{ConnHandle, Connection};
use crate::memory::{Memory, MessageBuf};
use crate::packet::{FrameError, PKG_HEADER_LEN, PacketHeader, encode_packet};
use crate::send::OutboundMessage;

/// A completed inbound frame on its way to a worker.
pub struct Envelope {
    pub handle: ConnHandle,
    pub conn: Arc<Connection>,
    /// Header followed by body, exactly `total_length` bytes.
    pub frame: MessageBuf,
}

/// Sink for encoded replies.
pub trait Outbound: Send + Sync {
    fn enqueue_send(&self, msg: OutboundMessage);
}

pub trait MessageHandler: Send + Sync {
    /// Handle one message. The return value is informational.
    fn handle(&self, session: &Session<'_>, header: &PacketHeader, body: &[u8]) -> bool;
}

impl<F> MessageHandler for F
where
    F: Fn(&Session<'_>, &PacketHeader, &[u8]) -> bool + Send + Sync,
{
    fn handle(&self, session: &Session<'_>, header: &PacketHeader, body: &[u8]) -> bool {
        self(session, header, body)
    }
}

/// The connection as seen from a handler.
pub struct Session<'a> {
    conn: &'a Arc<Connection>,
    handle: ConnHandle,
    outbound: &'a dyn Outbound,
    memory: &'a Arc<Memory>,
    checksum: &'a dyn Checksum,
}

impl<'a> Session<'a> {
    pub fn new(
        conn: &'a Arc<Connection>,
        handle: ConnHandle,
        outbound: &'a dyn Outbound,
        memory: &'a Arc<Memory>,
        checksum: &'a dyn Checksum,
    ) -> Self {
        Self {
            conn,
            handle,
            outbound,
            memory,
            checksum,
        }
    }

    /// Encode `body` under `message_code` and queue it for this connection.
    pub fn reply(&self, message_code: u16, body: &[u8]) -> Result<(), FrameError> {
        let buf = encode_packet(self.memory, message_code, body, self.checksum)?;
        self.outbound.enqueue_send(OutboundMessage {
            handle: self.handle,
            conn: Arc::clone(self.conn),
            buf,
        });
        Ok(())
    }

    /// Record a heartbeat from the peer.
    pub fn touch_heartbeat(&self) {
        self.conn.touch_ping(Instant::now());
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// False once the connection has been closed under this handler.
    pub fn is_current(&self) -> bool {
        self.conn.is_current(&self.handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(bool),
    Stale,
    Malformed,
    BadChecksum,
    UnknownCode(u16),
    NoHandler(u16),
}

pub struct Dispatcher {
    table: Vec<Option<Arc<dyn MessageHandler>>>,
    checksum: Arc<dyn Checksum>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder {
            table: Vec::new(),
            checksum: Arc::new(Crc32),
        }
    }

    pub fn checksum(&self) -> &dyn Checksum {
        &*self.checksum
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Validate and run one frame: generation, checksum, then code lookup.
    pub fn dispatch(&self, envelope: Envelope, outbound: &dyn Outbound, memory: &Arc<Memory>) -> DispatchOutcome {
        let Envelope { handle, conn, frame } = envelope;

        if !conn.is_current(&handle) {
            debug!(index = handle.index, "discarding message for a closed connection");
            return DispatchOutcome::Stale;
        }

        let Some(header) = PacketHeader::decode(&frame) else {
            return DispatchOutcome::Malformed;
        };
        if frame.len() != header.total_length as usize {
            return DispatchOutcome::Malformed;
        }
        let body = &frame[PKG_HEADER_LEN..];

        if !header.verify(body, &*self.checksum) {
            info!(
                code = header.message_code,
                peer = ?conn.peer_addr(),
                "checksum mismatch, message discarded"
            );
            return DispatchOutcome::BadChecksum;
        }

        let code = header.message_code;
        let Some(slot) = self.table.get(code as usize) else {
            warn!(code, peer = ?conn.peer_addr(), "message code out of range");
            return DispatchOutcome::UnknownCode(code);
        };
        let Some(handler) = slot else {
            info!(code, "no handler registered for message code");
            return DispatchOutcome::NoHandler(code);
        };

        let _logic = conn.lock_logic();
        if !conn.is_current(&handle) {
            return DispatchOutcome::Stale;
        }
        let session = Session::new(&conn, handle, outbound, memory, &*self.checksum);
        DispatchOutcome::Handled(handler.handle(&session, &header, body))
    }
}

pub struct DispatcherBuilder {
    table: Vec<Option<Arc<dyn MessageHandler>>>,
    checksum: Arc<dyn Checksum>,
}

impl DispatcherBuilder {
    pub fn route<H>(mut self, code: u16, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        let idx = code as usize;
        if self.table.len() <= idx {
            self.table.resize_with(idx + 1, || None);
        }
        self.table[idx] = Some(Arc::new(handler));
        self
    }

    /// Reserve table entries up to `code` without a handler.
    pub fn reserve(mut self, code: u16) -> Self {
        let idx = code as usize;
        if self.table.len() <= idx {
            self.table.resize_with(idx + 1, || None);
        }
        self
    }

    pub fn checksum(mut self, checksum: Arc<dyn Checksum>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            table: self.table,
            checksum: self.checksum,
        }
    }
}
