// src/pool.rs
//
// Half-sync/half-async worker pool: a bounded FIFO of task references
// drained by detached worker threads. The pool never synchronizes inside
// `process()`; exactly-once execution per readiness event is guaranteed by
// the reactor's one-shot re-arm protocol.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::trace;

use crate::error::{PetrelError, PetrelResult};
use crate::sync::Semaphore;

/// A unit of work the pool can execute.
pub trait Work: Send + Sync {
    fn process(&self);
}

pub struct ThreadPool<T: Work + 'static> {
    shared: Arc<PoolShared<T>>,
    workers: usize,
}

struct PoolShared<T> {
    queue: Mutex<VecDeque<Arc<T>>>,
    depth: usize,
    tasks: Semaphore,
    stop: AtomicBool,
}

impl<T: Work + 'static> ThreadPool<T> {
    /// Spawn `workers` detached threads draining a queue of at most
    /// `depth` entries. Zero for either is a construction error.
    pub fn new(workers: usize, depth: usize) -> PetrelResult<Self> {
        if workers == 0 {
            return Err(PetrelError::InvalidParameter { what: "worker count" });
        }
        if depth == 0 {
            return Err(PetrelError::InvalidParameter { what: "queue depth" });
        }

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            tasks: Semaphore::new(0),
            stop: AtomicBool::new(false),
        });

        for i in 0..workers {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("petrel-worker-{i}"))
                .spawn(move || worker_loop(i, shared))?;
        }

        Ok(Self { shared, workers })
    }

    /// Queue a task reference. Returns false without enqueuing when the
    /// queue already holds `depth` entries; the caller owns the outcome.
    pub fn submit(&self, task: Arc<T>) -> bool {
        {
            let mut queue = self.shared.queue.lock().expect("pool queue lock poisoned");
            if queue.len() >= self.shared.depth {
                return false;
            }
            queue.push_back(task);
        }
        self.shared.tasks.release();
        true
    }

    /// Cooperative stop. Workers finish their current task and exit;
    /// queued work may be abandoned. Threads are not joined.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        for _ in 0..self.workers {
            self.shared.tasks.release();
        }
    }
}

fn worker_loop<T: Work>(id: usize, shared: Arc<PoolShared<T>>) {
    trace!(worker = id, "worker started");
    loop {
        shared.tasks.acquire();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let task = shared
            .queue
            .lock()
            .expect("pool queue lock poisoned")
            .pop_front();
        // Run outside the lock; the one-shot protocol keeps any given
        // task out of the queue while it is being processed.
        if let Some(task) = task {
            task.process();
        }
    }
    trace!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTask {
        hits: AtomicUsize,
    }

    impl Work for CountingTask {
        fn process(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Blocks in process() until the test releases its gate, letting tests
    /// pin workers deterministically.
    struct GatedTask {
        gate: Semaphore,
        hits: AtomicUsize,
    }

    impl Work for GatedTask {
        fn process(&self) {
            self.gate.acquire();
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(hits: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "expected {} completions, saw {}",
            expected,
            hits.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn zero_workers_is_an_error() {
        assert!(ThreadPool::<CountingTask>::new(0, 10).is_err());
        assert!(ThreadPool::<CountingTask>::new(2, 0).is_err());
    }

    #[test]
    fn tasks_run_exactly_once_each() {
        let pool = ThreadPool::new(4, 100).unwrap();
        let task = Arc::new(CountingTask { hits: AtomicUsize::new(0) });
        for _ in 0..50 {
            assert!(pool.submit(Arc::clone(&task)));
        }
        wait_for(&task.hits, 50);
        pool.shutdown();
    }

    #[test]
    fn overflow_submissions_fail_and_accepted_work_completes() {
        let pool = ThreadPool::new(1, 2).unwrap();
        let task = Arc::new(GatedTask {
            gate: Semaphore::new(0),
            hits: AtomicUsize::new(0),
        });

        let mut accepted = 0;
        for _ in 0..5 {
            if pool.submit(Arc::clone(&task)) {
                accepted += 1;
            }
        }
        // The worker holds at most one task and the queue at most two, so
        // at least two of the five submissions must have been refused.
        assert!(accepted >= 2 && accepted <= 3, "accepted {accepted}");

        for _ in 0..accepted {
            task.gate.release();
        }
        wait_for(&task.hits, accepted);

        // Nothing else trickles in afterwards.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(task.hits.load(Ordering::SeqCst), accepted);
        pool.shutdown();
    }
}
