//! Fixed worker pool
//!
//! A small set of long-lived threads pulling jobs from one shared FIFO
//! channel. One job per idle worker; overflow queues in submission
//! order. No priorities, no cancellation. Used to offload tag writing
//! so one batch's image processing does not stall the caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker count from available parallelism, clamped to a small range.
pub fn default_worker_count() -> usize {
    let cpu_count = num_cpus::get();
    (cpu_count * 70 / 100).clamp(2, 8)
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `size` workers sharing one FIFO queue.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let active = Arc::clone(&active);
                std::thread::Builder::new()
                    .name(format!("stamp-worker-{}", id))
                    .spawn(move || worker_loop(id, receiver, active))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::info!(workers = size, "Worker pool started");

        Self {
            sender: Some(sender),
            workers,
            active,
        }
    }

    /// Queue a job. Runs on the next idle worker, FIFO.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            if sender.send(Box::new(job)).is_err() {
                tracing::error!("Worker pool queue closed, job dropped");
            }
        }
    }

    /// Number of workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Close the queue and wait for queued jobs to drain.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        // Dropping the sender ends every worker's recv loop once the
        // queue drains.
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

fn worker_loop(id: usize, receiver: Arc<Mutex<Receiver<Job>>>, active: Arc<AtomicUsize>) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };

        match job {
            Ok(job) => {
                active.fetch_add(1, Ordering::SeqCst);
                job();
                active.fetch_sub(1, Ordering::SeqCst);
            }
            Err(_) => {
                tracing::debug!(worker = id, "Worker stopping, queue closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_default_worker_count_bounds() {
        let count = default_worker_count();
        assert!(count >= 2);
        assert!(count <= 8);
    }

    #[test]
    fn test_all_submitted_jobs_run() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_single_worker_preserves_fifo_order() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let order = Arc::clone(&order);
            pool.submit(move || {
                order.lock().unwrap().push(i);
            });
        }

        pool.shutdown();
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_count_is_fixed() {
        let pool = WorkerPool::new(3);
        assert_eq!(pool.worker_count(), 3);

        for _ in 0..50 {
            pool.submit(|| std::thread::sleep(Duration::from_millis(1)));
        }
        assert_eq!(pool.worker_count(), 3);
        pool.shutdown();
    }

    #[test]
    fn test_jobs_run_concurrently_across_workers() {
        let pool = WorkerPool::new(4);
        let (tx, rx) = mpsc::channel();

        for _ in 0..4 {
            let tx = tx.clone();
            pool.submit(move || {
                std::thread::sleep(Duration::from_millis(100));
                tx.send(()).unwrap();
            });
        }

        // Four 100ms jobs on four workers should finish well inside 400ms
        let start = std::time::Instant::now();
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(350));
        pool.shutdown();
    }

    #[test]
    fn test_zero_size_clamped_to_one_worker() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.worker_count(), 1);

        let ran = Arc::new(AtomicU32::new(0));
        let flag = Arc::clone(&ran);
        pool.submit(move || {
            flag.store(1, Ordering::SeqCst);
        });
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
