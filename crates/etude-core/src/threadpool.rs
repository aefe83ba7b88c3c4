//! Fixed-size worker pool fed from one FIFO.
//!
//! Producers push and signal the condition variable; idle workers sleep on
//! it. On shutdown the workers exit at their next wakeup and whatever is
//! still queued is dropped by [`WorkerPool::stop_all`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::error::{EngineError, EngineResult};
use crate::metrics::LogThrottle;

/// Minimum spacing between "all workers busy" reports.
const EMERGENCY_LOG_INTERVAL: Duration = Duration::from_secs(10);

struct QueueState<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

struct Shared<T> {
    queue: Mutex<QueueState<T>>,
    cond: Condvar,
    depth: AtomicUsize,
    running: AtomicUsize,
    started: AtomicUsize,
    saturated: LogThrottle,
}

pub struct WorkerPool<T> {
    shared: Arc<Shared<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    shutdown: false,
                }),
                cond: Condvar::new(),
                depth: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                started: AtomicUsize::new(0),
                saturated: LogThrottle::new(EMERGENCY_LOG_INTERVAL),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `count` workers named `{name}-{i}` running `handler` for every
    /// item. Returns once all of them are waiting for work.
    pub fn start<F>(&self, name: &str, count: usize, handler: F) -> EngineResult<()>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let count = count.max(1);

        for i in 0..count {
            let shared = Arc::clone(&self.shared);
            let handler = Arc::clone(&handler);
            let thread_name = format!("{}-{}", name, i);
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(shared, handler));

            match spawned {
                Ok(handle) => self.threads.lock().push(handle),
                Err(source) => {
                    self.stop_all();
                    return Err(EngineError::ThreadSpawn {
                        name: thread_name,
                        source,
                    });
                }
            }
        }

        while self.shared.started.load(Ordering::Acquire) < self.thread_count() {
            thread::sleep(Duration::from_millis(1));
        }
        info!(workers = count, pool = name, "worker pool started");
        Ok(())
    }

    /// Queue one item and wake a worker.
    pub fn push(&self, item: T) {
        {
            let mut queue = self.shared.queue.lock();
            queue.items.push_back(item);
            self.shared.depth.fetch_add(1, Ordering::AcqRel);
        }
        self.shared.cond.notify_one();

        let threads = self.thread_count();
        if threads > 0 && self.running() >= threads {
            self.report_saturation(threads);
        }
    }

    fn report_saturation(&self, threads: usize) {
        if !self.shared.saturated.ready(Instant::now()) {
            return;
        }
        error!(
            threads,
            queued = self.depth(),
            "all worker threads are busy; consider raising ProcMsgRecvWorkThreadCount"
        );
    }

    /// Items waiting for a worker.
    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// Workers currently inside the handler.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Stop and join every worker, then drop queued items.
    /// Returns how many items were discarded.
    pub fn stop_all(&self) -> usize {
        self.shared.queue.lock().shutdown = true;
        self.shared.cond.notify_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread terminated by panic");
            }
        }

        let leftover = std::mem::take(&mut self.shared.queue.lock().items);
        self.shared.depth.store(0, Ordering::Release);
        leftover.len()
    }
}

impl<T: Send + 'static> Default for WorkerPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop<T, F>(shared: Arc<Shared<T>>, handler: Arc<F>)
where
    F: Fn(T),
{
    shared.started.fetch_add(1, Ordering::AcqRel);
    loop {
        let item = {
            let mut queue = shared.queue.lock();
            while queue.items.is_empty() && !queue.shutdown {
                shared.cond.wait(&mut queue);
            }
            if queue.shutdown {
                return;
            }
            let Some(item) = queue.items.pop_front() else {
                continue;
            };
            shared.depth.fetch_sub(1, Ordering::AcqRel);
            item
        };

        shared.running.fetch_add(1, Ordering::AcqRel);
        run_handler(&*handler, item);
        shared.running.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(feature = "catch-panic")]
fn run_handler<T, F: Fn(T)>(handler: &F, item: T) {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    if catch_unwind(AssertUnwindSafe(|| handler(item))).is_err() {
        error!("message handler panicked; worker continues");
    }
}

#[cfg(not(feature = "catch-panic"))]
fn run_handler<T, F: Fn(T)>(handler: &F, item: T) {
    handler(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn every_item_is_processed_once() {
        let pool = WorkerPool::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        pool.start("test-worker", 4, move |n: u32| {
            let _ = tx.lock().send(n);
        })
        .unwrap();
        assert_eq!(pool.thread_count(), 4);

        for n in 0..100 {
            pool.push(n);
        }
        let mut got: Vec<u32> = (0..100)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..100).collect::<Vec<_>>());

        assert_eq!(pool.stop_all(), 0);
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn stop_all_discards_queued_items() {
        let pool = WorkerPool::new();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        pool.start("test-blocked", 1, move |_: Arc<()>| {
            let _ = entered_tx.lock().send(());
            let _ = gate_rx.lock().recv();
        })
        .unwrap();

        let item = Arc::new(());
        pool.push(Arc::clone(&item));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.running(), 1);

        pool.push(Arc::clone(&item));
        pool.push(Arc::clone(&item));
        assert_eq!(pool.depth(), 2);

        drop(gate_tx);
        let discarded = pool.stop_all();
        assert!(discarded <= 2);
        assert_eq!(pool.depth(), 0);
        assert_eq!(Arc::strong_count(&item), 1);
    }

    #[cfg(feature = "catch-panic")]
    #[test]
    fn a_panicking_handler_does_not_kill_the_worker() {
        let pool = WorkerPool::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        pool.start("test-panic", 1, move |n: u32| {
            if n == 0 {
                panic!("boom");
            }
            let _ = tx.lock().send(n);
        })
        .unwrap();

        pool.push(0);
        pool.push(7);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.stop_all();
    }
}
