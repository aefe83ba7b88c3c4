//! Readiness notification over epoll.
//!
//! Registrations carry a [`ConnHandle`] token so that an event can be matched
//! against the slot's current tenure before any handler runs.

use std::io;
use std::os::fd::RawFd;

use crate::conn::ConnHandle;
use crate::error::EngineResult;
use crate::syscalls::Epoll;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READ: Interest = Interest((libc::EPOLLIN | libc::EPOLLRDHUP) as u32);
    pub const READ_WRITE: Interest = Interest((libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLOUT) as u32);

    pub fn bits(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// One decoded readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub index: usize,
    /// Low 32 bits of the generation the registration was made with.
    pub generation: u32,
    pub readiness: Readiness,
}

impl Event {
    fn from_raw(raw: &libc::epoll_event) -> Self {
        let bits = raw.events;
        let (index, generation) = ConnHandle::split_token(raw.u64);
        let failed = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
        Self {
            index,
            generation,
            readiness: Readiness {
                readable: failed || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                writable: failed || bits & libc::EPOLLOUT as u32 != 0,
            },
        }
    }

    pub fn matches(&self, generation: u64) -> bool {
        self.generation == generation as u32
    }
}

pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.raw[..self.len].iter().map(Event::from_raw)
    }
}

pub struct Poller {
    epoll: Epoll,
}

impl Poller {
    pub fn new() -> EngineResult<Self> {
        Ok(Self { epoll: Epoll::new()? })
    }

    pub fn register(&self, fd: RawFd, interest: Interest, handle: ConnHandle) -> io::Result<()> {
        self.epoll.add(fd, handle.token(), interest.bits())
    }

    pub fn reregister(&self, fd: RawFd, interest: Interest, handle: ConnHandle) -> io::Result<()> {
        self.epoll.modify(fd, handle.token(), interest.bits())
    }

    /// Removing an fd that was never registered is not an error.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.epoll.delete(fd)
    }

    /// Wait up to `timeout_ms` (-1 blocks). Interrupted waits return 0.
    pub fn wait(&self, events: &mut Events, timeout_ms: i32) -> io::Result<usize> {
        events.len = 0;
        let n = self.epoll.wait(&mut events.raw, timeout_ms)?;
        events.len = n;
        Ok(n)
    }
}
