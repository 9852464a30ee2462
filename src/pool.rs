//! A small fixed-size worker pool draining a shared task queue.
//!
//! This is the Rust equivalent of the original's thread pool executor: a
//! handful of threads pull closures off a queue and run them. One of those
//! closures is always the reactor's own driver loop (see
//! `server::Server::start`), which is why the pool needs at least two
//! threads to make any forward progress -- one to keep polling, one to run
//! what polling finds.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::reactor::Task;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    running: Mutex<bool>,
}

/// A fixed-size thread pool. Always used behind an `Arc<Pool>` so that
/// tasks running on the pool (in particular the reactor's driver loop) can
/// submit further work back to it.
pub struct Pool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(thread_count: usize) -> Pool {
        let thread_count = thread_count.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            running: Mutex::new(true),
        });
        let handles = (0..thread_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("pollftpd-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        log::debug!("worker pool started with {thread_count} threads");
        Pool {
            shared,
            handles: Mutex::new(handles),
        }
    }

    pub fn submit(&self, task: Task) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(task);
        self.shared.cond.notify_one();
    }

    /// Tells every worker to stop once its current task finishes, wakes
    /// them all up, and joins them. Blocks until every worker has exited.
    pub fn shutdown_and_join(&self) {
        *self.shared.running.lock().unwrap() = false;
        self.shared.cond.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let mut queue = shared.queue.lock().unwrap();
        loop {
            if let Some(task) = queue.pop_front() {
                drop(queue);
                task();
                break;
            }
            if !*shared.running.lock().unwrap() {
                return;
            }
            queue = shared.cond.wait(queue).unwrap();
        }
    }
}
