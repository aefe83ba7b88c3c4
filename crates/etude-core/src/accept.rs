// src/accept.rs
use std::os::fd::RawFd;
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::event_loop::{Interest, Poller};
use crate::heartbeat::HeartbeatRegistry;
use crate::metrics::EngineMetrics;
use crate::pool::{ConnectionPool, PoolStats};
use crate::syscalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `worker_connections` clients are already online.
    Full { online: usize },
    /// The pool has ballooned while its free list ran low, typically from
    /// connect/disconnect churn outrunning the recycle window.
    PoolChurn { total: usize, free: usize },
}

/// Admission thresholds applied to every accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub max_online: usize,
    pub pool_multiple: usize,
    pub free_floor: usize,
}

impl Admission {
    pub fn admit(&self, online: usize, pool: &PoolStats) -> Result<(), Rejection> {
        if online >= self.max_online {
            return Err(Rejection::Full { online });
        }
        if pool.total > self.pool_multiple.saturating_mul(self.max_online) && pool.free < self.free_floor {
            return Err(Rejection::PoolChurn {
                total: pool.total,
                free: pool.free,
            });
        }
        Ok(())
    }
}

pub(crate) struct Acceptor<'a> {
    pub pool: &'a ConnectionPool,
    pub poller: &'a Poller,
    pub heartbeat: Option<&'a HeartbeatRegistry>,
    pub metrics: &'a EngineMetrics,
    pub admission: Admission,
}

impl Acceptor<'_> {
    /// Accept until the backlog is drained. Returns how many were admitted.
    pub fn drain_backlog(&self, listen_fd: RawFd) -> usize {
        let mut admitted = 0;
        loop {
            let (fd, peer) = match syscalls::accept_connection(listen_fd) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(err) => match err.raw_os_error() {
                    Some(libc::ECONNABORTED) | Some(libc::EINTR) | Some(libc::EPROTO) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
                        error!(error = %err, "accept failed: out of resources");
                        break;
                    }
                    _ => {
                        error!(error = %err, "accept failed");
                        break;
                    }
                },
            };

            if let Err(rejection) = self.admission.admit(self.metrics.online(), &self.pool.stats()) {
                warn!(?rejection, ?peer, "connection rejected");
                EngineMetrics::inc(&self.metrics.rejected);
                syscalls::close(fd);
                continue;
            }

            let (handle, conn) = match self.pool.acquire(fd) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, ?peer, "no connection slot available");
                    EngineMetrics::inc(&self.metrics.rejected);
                    syscalls::close(fd);
                    continue;
                }
            };
            if let Some(peer) = peer {
                conn.set_peer(peer);
            }

            if let Err(err) = self.poller.register(fd, Interest::READ, handle) {
                error!(fd, error = %err, "failed to register accepted socket");
                if let Some(fd) = self.pool.release(handle) {
                    syscalls::close(fd);
                }
                continue;
            }

            if let Some(heartbeat) = self.heartbeat {
                heartbeat.add(handle, Instant::now());
            }
            self.metrics.inc_online();
            admitted += 1;
            debug!(fd, index = handle.index, ?peer, "connection accepted");
        }
        admitted
    }
}
