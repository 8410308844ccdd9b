//! Single-worker FIFO task queue.
//!
//! One dedicated worker thread executes submitted tasks strictly in
//! submission order, one at a time. A panicking task is caught, logged
//! and does not kill the worker: one bad computation must not stop the
//! queue from processing subsequent tasks.
//!
//! Lifecycle is explicit: the composition root owns the [`TaskQueue`]
//! and calls [`TaskQueue::stop`] at shutdown; everything else holds a
//! cloneable [`QueueHandle`] for submission only. The stop flag is
//! checked between tasks, and there is no cancellation of an in-flight
//! task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Owner side of the queue: spawns the worker, joins it on stop.
pub struct TaskQueue {
    handle: QueueHandle,
    worker: Option<JoinHandle<()>>,
}

/// Cloneable submitter side.
#[derive(Clone)]
pub struct QueueHandle {
    tx: Sender<Task>,
    stopped: Arc<AtomicBool>,
    executed: Arc<AtomicU64>,
}

impl TaskQueue {
    /// Spawn the worker thread and return the queue owner.
    pub fn start(name: &str) -> Self {
        let (tx, rx) = channel::<Task>();
        let stopped = Arc::new(AtomicBool::new(false));
        let executed = Arc::new(AtomicU64::new(0));

        let worker_stopped = Arc::clone(&stopped);
        let worker_executed = Arc::clone(&executed);
        let worker = std::thread::Builder::new()
            .name(format!("queue-{name}"))
            .spawn(move || run_worker(rx, worker_stopped, worker_executed))
            .unwrap_or_else(|e| panic!("failed to spawn queue worker thread: {e}"));

        Self {
            handle: QueueHandle {
                tx,
                stopped,
                executed,
            },
            worker: Some(worker),
        }
    }

    /// Submitter handle for sharing with computed PVs.
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Stop accepting tasks and join the worker. Tasks still pending
    /// when the flag is observed are dropped.
    pub fn stop(mut self) {
        self.handle.stopped.store(true, Ordering::SeqCst);
        // Wake the worker if it is blocked on an empty queue.
        let _ = self.handle.tx.send(Box::new(|| {}));
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("queue worker terminated abnormally");
        }
        debug!(
            executed = self.handle.executed.load(Ordering::Relaxed),
            "task queue stopped"
        );
    }
}

impl QueueHandle {
    /// Enqueue a task. Returns `false` once the queue has been stopped.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send(Box::new(task)).is_ok()
    }

    /// Number of tasks executed so far, for diagnostics.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

fn run_worker(rx: Receiver<Task>, stopped: Arc<AtomicBool>, executed: Arc<AtomicU64>) {
    while let Ok(task) = rx.recv() {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            // The panic payload was already reported by the panic hook;
            // the queue itself must keep serving subsequent tasks.
            warn!("queued task panicked; worker continues");
        }
        executed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Submit a marker task and wait for it, proving every earlier task
    /// has executed (FIFO).
    fn drain(handle: &QueueHandle) {
        let (tx, rx) = mpsc::channel();
        assert!(handle.submit(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn executes_in_fifo_order_one_at_a_time() {
        let queue = TaskQueue::start("test");
        let handle = queue.handle();

        let order = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicU64::new(0));

        for i in 0..32u64 {
            let order = Arc::clone(&order);
            let in_flight = Arc::clone(&in_flight);
            handle.submit(move || {
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0, "task overlap");
                if i % 5 == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
                order.lock().unwrap().push(i);
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        drain(&handle);

        let order = order.lock().unwrap();
        assert_eq!(*order, (0..32).collect::<Vec<_>>());
        queue.stop();
    }

    #[test]
    fn fifo_across_submitting_threads() {
        let queue = TaskQueue::start("test");
        let handle = queue.handle();

        let log = Arc::new(Mutex::new(Vec::new()));
        let submitted = Arc::new(Mutex::new(Vec::new()));

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let handle = handle.clone();
                let log = Arc::clone(&log);
                let submitted = Arc::clone(&submitted);
                s.spawn(move || {
                    for i in 0..8u64 {
                        let tag = t * 100 + i;
                        let log = Arc::clone(&log);
                        // Record submission order and execution order
                        // under the same lock, atomically with send.
                        let mut sub = submitted.lock().unwrap();
                        handle.submit(move || log.lock().unwrap().push(tag));
                        sub.push(tag);
                    }
                });
            }
        });
        drain(&handle);

        assert_eq!(*log.lock().unwrap(), *submitted.lock().unwrap());
        queue.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let queue = TaskQueue::start("test");
        let handle = queue.handle();

        handle.submit(|| panic!("deliberate"));
        let (tx, rx) = mpsc::channel();
        handle.submit(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        queue.stop();
    }

    #[test]
    fn stopped_queue_rejects_tasks() {
        let queue = TaskQueue::start("test");
        let handle = queue.handle();
        queue.stop();
        assert!(!handle.submit(|| {}));
    }
}
