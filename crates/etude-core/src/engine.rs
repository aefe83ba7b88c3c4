//! The socket engine: listeners, the readiness loop and its helper threads.
//!
//! Lifecycle:
//!
//! 1. [`SocketEngine::initialize`] binds the listening sockets.
//! 2. [`SocketEngine::initialize_subprocess`] builds the pool and poller,
//!    registers the listeners and starts the worker, sender, reaper and
//!    heartbeat threads.
//! 3. The owning thread calls [`SocketEngine::process_events_and_timers`] in
//!    a loop until [`SocketEngine::stop_handle`] is raised.
//! 4. [`SocketEngine::shutdown_subprocess`] joins every thread and releases
//!    every connection and buffer.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::accept::Acceptor;
use crate::config::EngineConfig;
use crate::conn::{ConnHandle, Connection, ReadHandler, WriteHandler};
use crate::dispatch::{Dispatcher, Envelope, Outbound};
use crate::error::{EngineError, EngineResult};
use crate::event_loop::{Event, Events, Interest, Poller};
use crate::framing::Progress;
use crate::heartbeat::{HeartbeatRegistry, should_kick};
use crate::memory::{Memory, MessageBuf};
use crate::metrics::{Diagnostics, EngineMetrics, LogThrottle};
use crate::pool::ConnectionPool;
use crate::send::{self, Enqueue, OutboundMessage, SendQueue};
use crate::syscalls::{self, RecvOutcome};
use crate::threadpool::WorkerPool;

const REAP_INTERVAL: Duration = Duration::from_millis(200);
const HEARTBEAT_SCAN_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_BATCH: usize = 512;
/// Inbound backlog above which diagnostics turn into a warning.
const RECV_QUEUE_WARN: usize = 100_000;

struct Listener {
    fd: RawFd,
    port: u16,
    handle: Option<ConnHandle>,
}

/// State shared by the event loop and the helper threads.
struct Core {
    config: EngineConfig,
    memory: Arc<Memory>,
    pool: ConnectionPool,
    poller: Poller,
    metrics: EngineMetrics,
    inbound: WorkerPool<Envelope>,
    sendq: SendQueue,
    heartbeat: Option<HeartbeatRegistry>,
    dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    send_drops: LogThrottle,
}

impl Core {
    fn handle_event(&self, event: Event) {
        let Some(conn) = self.pool.get(event.index) else {
            return;
        };
        let generation = conn.generation();
        if generation & 1 == 0 || !event.matches(generation) {
            debug!(index = event.index, "dropping event for a retired connection");
            return;
        }
        let handle = ConnHandle {
            index: event.index,
            generation,
        };

        if event.readiness.readable {
            match conn.read_handler() {
                ReadHandler::Accept => self.accept(conn.fd()),
                ReadHandler::Request => self.read_request(&conn, handle),
            }
        }
        if event.readiness.writable
            && conn.is_current(&handle)
            && conn.write_handler() == WriteHandler::Send
            && send::continue_parked(&conn, handle, &self.poller, &self.metrics)
        {
            self.sendq.post();
        }
    }

    fn accept(&self, listen_fd: RawFd) {
        Acceptor {
            pool: &self.pool,
            poller: &self.poller,
            heartbeat: self.heartbeat.as_ref(),
            metrics: &self.metrics,
            admission: self.config.admission(),
        }
        .drain_backlog(listen_fd);
    }

    fn read_request(&self, conn: &Arc<Connection>, handle: ConnHandle) {
        let mut recv = conn.lock_recv();
        if !conn.is_current(&handle) {
            return;
        }
        let fd = conn.fd();
        let outcome = syscalls::recv_nonblocking(fd, recv.window());

        match outcome {
            Ok(RecvOutcome::Data(n)) => match recv.advance(n) {
                Progress::Pending => {}
                Progress::Malformed(err) => {
                    EngineMetrics::inc(&self.metrics.malformed_frames);
                    debug!(fd, error = %err, "malformed header, frame discarded");
                }
                Progress::Complete => {
                    let frame = recv.take_frame();
                    drop(recv);
                    if let Some(frame) = frame {
                        self.frame_complete(conn, handle, frame);
                    }
                }
            },
            Ok(RecvOutcome::WouldBlock) => {}
            Ok(RecvOutcome::Closed) => {
                drop(recv);
                debug!(fd, peer = ?conn.peer_addr(), "peer closed connection");
                self.close_connection(handle);
            }
            Err(err) => {
                drop(recv);
                if err.raw_os_error() == Some(libc::ECONNRESET) {
                    debug!(fd, "connection reset by peer");
                } else {
                    warn!(fd, error = %err, "recv failed");
                }
                self.close_connection(handle);
            }
        }
    }

    fn frame_complete(&self, conn: &Arc<Connection>, handle: ConnHandle, frame: MessageBuf) {
        EngineMetrics::inc(&self.metrics.frames_received);

        if self.config.flood_enabled
            && conn.check_flood(Instant::now(), self.config.flood_interval, self.config.flood_kick_count)
        {
            info!(peer = ?conn.peer_addr(), "flood detected, closing connection");
            EngineMetrics::inc(&self.metrics.flood_kicks);
            drop(frame);
            self.close_connection(handle);
            return;
        }

        self.inbound.push(Envelope {
            handle,
            conn: Arc::clone(conn),
            frame,
        });
    }

    /// The single close path. Stale handles are ignored.
    fn close_connection(&self, handle: ConnHandle) {
        let Some(fd) = self.pool.deferred_release(handle, Instant::now()) else {
            return;
        };
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.remove(handle);
        }
        if let Err(err) = self.poller.deregister(fd) {
            debug!(fd, error = %err, "epoll delete failed");
        }
        syscalls::close(fd);
        self.metrics.dec_online();
        debug!(fd, index = handle.index, "connection closed");
    }

    fn scan_heartbeats(&self, heartbeat: &HeartbeatRegistry, now: Instant) {
        for handle in heartbeat.expired(now) {
            let Some(conn) = self.pool.resolve(handle) else {
                continue;
            };
            if should_kick(
                conn.last_ping(),
                now,
                heartbeat.wait(),
                self.config.heartbeat_grace,
                self.config.timeout_kick,
            ) {
                info!(peer = ?conn.peer_addr(), "heartbeat timeout, closing connection");
                EngineMetrics::inc(&self.metrics.heartbeat_kicks);
                self.close_connection(handle);
            }
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            counters: self.metrics.snapshot(),
            pool: self.pool.stats(),
            max_online: self.config.worker_connections,
            recv_queue_depth: self.inbound.depth(),
            workers_busy: self.inbound.running(),
            send_queue_depth: self.sendq.len(),
            heartbeat_entries: self.heartbeat.as_ref().map_or(0, HeartbeatRegistry::len),
            live_buffers: self.memory.live(),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Sleep for `total`, waking early once stopped. Returns false if stopped.
    fn nap(&self, total: Duration) -> bool {
        let step = Duration::from_millis(50);
        let deadline = Instant::now() + total;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(step.min(deadline - now));
        }
        false
    }
}

impl Outbound for Core {
    fn enqueue_send(&self, msg: OutboundMessage) {
        let handle = msg.handle;
        match self.sendq.push(msg) {
            Enqueue::Queued => {}
            Enqueue::QueueFull => {
                EngineMetrics::inc(&self.metrics.sends_discarded);
                if self.send_drops.ready(Instant::now()) {
                    warn!(queued = self.sendq.len(), "send queue full, dropping outbound messages");
                }
            }
            Enqueue::Stale => {
                debug!(index = handle.index, "reply for a closed connection dropped");
            }
            Enqueue::ConnectionBacklogged => {
                EngineMetrics::inc(&self.metrics.sends_discarded);
                warn!(index = handle.index, "peer is not reading its replies, closing connection");
                self.close_connection(handle);
            }
        }
    }
}

pub struct SocketEngine {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    listeners: Vec<Listener>,
    core: Option<Arc<Core>>,
    threads: Vec<JoinHandle<()>>,
    events: Events,
    last_diagnostics: Instant,
}

impl SocketEngine {
    pub fn new(config: EngineConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            stop: Arc::new(AtomicBool::new(false)),
            listeners: Vec::new(),
            core: None,
            threads: Vec::new(),
            events: Events::with_capacity(EVENT_BATCH),
            last_diagnostics: Instant::now(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind every configured listening port.
    pub fn initialize(&mut self) -> EngineResult<()> {
        if !self.listeners.is_empty() {
            return Err(EngineError::AlreadyInitialized);
        }
        for &port in &self.config.listen_ports {
            match open_listener(&self.config.listen_host, port) {
                Ok(listener) => {
                    info!(host = %self.config.listen_host, port = listener.port, "listening");
                    self.listeners.push(listener);
                }
                Err(err) => {
                    self.close_listeners();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Build the per-process machinery and start the helper threads.
    pub fn initialize_subprocess(&mut self) -> EngineResult<()> {
        if self.listeners.is_empty() {
            return Err(EngineError::NotInitialized);
        }
        if self.core.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }

        let cfg = self.config.clone();
        let memory = Memory::new();
        let capacity = cfg.worker_connections + self.listeners.len();
        let heartbeat = cfg
            .heartbeat_enabled
            .then(|| HeartbeatRegistry::new(cfg.heartbeat_wait, !cfg.timeout_kick));

        let core = Arc::new(Core {
            pool: ConnectionPool::new(capacity, cfg.pool_elastic, Arc::clone(&memory), cfg.max_packet_len),
            poller: Poller::new()?,
            metrics: EngineMetrics::new(),
            inbound: WorkerPool::new(),
            sendq: SendQueue::new(cfg.max_send_queue, cfg.max_conn_send_queue),
            heartbeat,
            dispatcher: Arc::clone(&self.dispatcher),
            stop: Arc::clone(&self.stop),
            send_drops: LogThrottle::new(Duration::from_secs(10)),
            memory,
            config: cfg,
        });

        for listener in &mut self.listeners {
            let (handle, conn) = core.pool.acquire(listener.fd)?;
            conn.mark_listener(listener.port);
            core.poller.register(listener.fd, Interest::READ, handle)?;
            listener.handle = Some(handle);
        }
        self.core = Some(Arc::clone(&core));

        if let Err(err) = self.start_threads(&core) {
            error!(error = %err, "failed to start engine threads");
            self.shutdown_subprocess();
            return Err(err);
        }
        info!(
            workers = core.config.worker_threads,
            capacity,
            heartbeat = core.heartbeat.is_some(),
            "engine started"
        );
        Ok(())
    }

    fn start_threads(&mut self, core: &Arc<Core>) -> EngineResult<()> {
        let worker_core = Arc::clone(core);
        core.inbound.start("etude-worker", core.config.worker_threads, move |envelope| {
            let core = &*worker_core;
            core.dispatcher.dispatch(envelope, core, &core.memory);
        })?;

        let c = Arc::clone(core);
        self.threads.push(spawn("etude-sender", move || {
            while let Some(batch) = c.sendq.wait_batch() {
                let held = send::send_batch(batch, &c.poller, &c.metrics);
                c.sendq.requeue_front(held);
            }
        })?);

        let c = Arc::clone(core);
        self.threads.push(spawn("etude-reaper", move || {
            while c.nap(REAP_INTERVAL) {
                let freed = c.pool.reap(Instant::now(), c.config.recycle_wait, false);
                if freed > 0 {
                    debug!(freed, "recycled connection slots");
                }
            }
        })?);

        if core.heartbeat.is_some() {
            let c = Arc::clone(core);
            self.threads.push(spawn("etude-heartbeat", move || {
                while c.nap(HEARTBEAT_SCAN_INTERVAL) {
                    if let Some(heartbeat) = &c.heartbeat {
                        c.scan_heartbeats(heartbeat, Instant::now());
                    }
                }
            })?);
        }
        Ok(())
    }

    /// Wait for readiness once, run the handlers, then any due timers.
    /// Returns the number of events handled.
    pub fn process_events_and_timers(&mut self) -> EngineResult<usize> {
        let core = Arc::clone(self.core.as_ref().ok_or(EngineError::NotInitialized)?);
        let timeout = core.config.poll_timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = match core.poller.wait(&mut self.events, timeout) {
            Ok(n) => n,
            Err(err) => {
                error!(error = %err, "epoll_wait failed");
                0
            }
        };
        for event in self.events.iter() {
            core.handle_event(event);
        }

        if let Some(interval) = core.config.diagnostics_interval {
            if self.last_diagnostics.elapsed() >= interval {
                self.last_diagnostics = Instant::now();
                self.print_diagnostics();
            }
        }
        Ok(n)
    }

    /// Drive the loop until the stop flag is raised, then shut down.
    pub fn run(&mut self) -> EngineResult<()> {
        while !self.stop.load(Ordering::Acquire) {
            self.process_events_and_timers()?;
        }
        self.shutdown_subprocess();
        Ok(())
    }

    /// Queue an encoded packet for a connection.
    pub fn enqueue_send(&self, msg: OutboundMessage) {
        match &self.core {
            Some(core) => core.enqueue_send(msg),
            None => debug!("engine not running, outbound message dropped"),
        }
    }

    /// Log a diagnostics snapshot.
    pub fn print_diagnostics(&self) {
        let Some(d) = self.diagnostics() else {
            return;
        };
        info!(target: "etude::diagnostics", "{}", d.to_json());
        if d.recv_queue_depth > RECV_QUEUE_WARN {
            warn!(
                depth = d.recv_queue_depth,
                "inbound queue is backing up; consider more worker threads"
            );
        }
    }

    pub fn diagnostics(&self) -> Option<Diagnostics> {
        self.core.as_ref().map(|core| core.diagnostics())
    }

    /// Flag that makes [`run`](Self::run) and the helper threads wind down.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Ports actually bound, in configuration order.
    pub fn local_ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    /// Stop every thread and release every connection, buffer and listener.
    pub fn shutdown_subprocess(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(core) = self.core.take() else {
            self.close_listeners();
            return;
        };

        let discarded = core.inbound.stop_all();
        core.sendq.shutdown();
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "engine thread panicked");
            }
        }

        for listener in &mut self.listeners {
            if let Some(handle) = listener.handle.take() {
                if core.pool.release(handle).is_some() {
                    let _ = core.poller.deregister(listener.fd);
                }
            }
        }
        self.close_listeners();

        for handle in core.pool.live_handles() {
            core.close_connection(handle);
        }
        let unsent = core.sendq.clear();
        core.pool.reap(Instant::now(), Duration::ZERO, true);
        if let Some(heartbeat) = &core.heartbeat {
            heartbeat.clear();
        }
        info!(discarded, unsent, "engine stopped");
    }

    fn close_listeners(&mut self) {
        for listener in self.listeners.drain(..) {
            syscalls::close(listener.fd);
        }
    }
}

impl Drop for SocketEngine {
    fn drop(&mut self) {
        self.shutdown_subprocess();
    }
}

fn open_listener(host: &str, port: u16) -> EngineResult<Listener> {
    let fd = syscalls::create_listen_socket(host, port)?;
    match syscalls::local_port(fd) {
        Ok(port) => Ok(Listener { fd, port, handle: None }),
        Err(err) => {
            syscalls::close(fd);
            Err(err.into())
        }
    }
}

fn spawn<F>(name: &str, f: F) -> EngineResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| EngineError::ThreadSpawn {
            name: name.to_string(),
            source,
        })
}
