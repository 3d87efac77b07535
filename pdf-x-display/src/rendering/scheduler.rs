//! Where interpreter continuations run after a time slice expires.

use tokio::runtime::Handle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs render continuations.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, job: Job);
}

/// Yields to the tokio event loop before running the job, so other tasks
/// on the same runtime get a turn between time slices.
#[derive(Debug, Clone)]
pub struct EventLoopScheduler {
    handle: Handle,
}

impl EventLoopScheduler {
    pub fn new(handle: Handle) -> Self {
        EventLoopScheduler { handle }
    }

    /// Uses the runtime of the calling task.
    pub fn current() -> Self {
        EventLoopScheduler {
            handle: Handle::current(),
        }
    }
}

impl Scheduler for EventLoopScheduler {
    fn schedule(&self, job: Job) {
        self.handle.spawn(async move {
            tokio::task::yield_now().await;
            job();
        });
    }
}

/// Runs continuations on the global rayon pool.
#[cfg(feature = "thread-pool")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadPoolScheduler;

#[cfg(feature = "thread-pool")]
impl Scheduler for ThreadPoolScheduler {
    fn schedule(&self, job: Job) {
        rayon::spawn(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_loop_scheduler_runs_job() {
        let scheduler = EventLoopScheduler::current();
        let (tx, rx) = tokio::sync::oneshot::channel();
        scheduler.schedule(Box::new(move || {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_jobs_do_not_run_inline() {
        let scheduler = EventLoopScheduler::current();
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job_counter = Arc::clone(&counter);
        scheduler.schedule(Box::new(move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        rx.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[cfg(feature = "thread-pool")]
    #[test]
    fn test_thread_pool_scheduler_runs_job() {
        let (tx, rx) = std::sync::mpsc::channel();
        ThreadPoolScheduler.schedule(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert_eq!(rx.recv().unwrap(), 7);
    }
}
