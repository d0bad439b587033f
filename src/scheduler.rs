use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::DispatchPool;

/// A boxed unit of work for a [`Scheduler`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// A logical queue onto which work may be scheduled, immediately or after a
/// delay.
///
/// This is the only dependency commands have on their execution
/// environment. Implementations include the threaded [`DispatchPool`], the
/// inline [`CurrentThread`], and the deterministic
/// [`VirtualScheduler`](crate::VirtualScheduler) for tests.
pub trait Scheduler: Send + Sync {
    /// Schedule work to run as soon as possible.
    fn schedule(&self, work: Work);

    /// Schedule work to run once `delay` has elapsed on this scheduler's
    /// clock.
    fn schedule_after(&self, delay: Duration, work: Work);

    /// Return the current time according to this scheduler's clock.
    fn now(&self) -> Instant;
}

/// The pair of queues used by an [`AsyncCommand`](crate::AsyncCommand).
///
/// The _worker_ queue runs the (possibly blocking) registered function, and
/// may run several units of work in parallel. The _result_ queue is where
/// outcomes are published and in-flight counts are released, and should
/// run a single unit at a time.
///
/// This is passed explicitly to each command on construction, and may be
/// inexpensively cloned to share queues between commands.
#[derive(Clone)]
pub struct Schedulers {
    worker: Arc<dyn Scheduler>,
    result: Arc<dyn Scheduler>,
}

impl Schedulers {
    /// Construct from explicit worker and result queues.
    pub fn new(worker: Arc<dyn Scheduler>, result: Arc<dyn Scheduler>)
        -> Schedulers
    {
        Schedulers { worker, result }
    }

    /// Both queues run work inline on the calling thread.
    ///
    /// With these, `execute` completes (and publishes) before it returns.
    pub fn immediate() -> Schedulers {
        let inline: Arc<dyn Scheduler> = Arc::new(CurrentThread);
        Schedulers { worker: inline.clone(), result: inline }
    }

    /// A default sized [`DispatchPool`] worker queue and a single threaded
    /// `DispatchPool` result queue.
    pub fn threaded() -> Schedulers {
        let worker = DispatchPool::builder()
            .name_prefix("rcmd-worker-")
            .create();
        let result = DispatchPool::builder()
            .pool_size(1)
            .name_prefix("rcmd-result-")
            .create();
        Schedulers { worker: Arc::new(worker), result: Arc::new(result) }
    }

    /// Return the worker queue.
    pub fn worker(&self) -> &Arc<dyn Scheduler> {
        &self.worker
    }

    /// Return the result queue.
    pub fn result(&self) -> &Arc<dyn Scheduler> {
        &self.result
    }
}

impl fmt::Debug for Schedulers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedulers").finish()
    }
}

/// A scheduler that runs all work inline, on the calling thread.
///
/// Delayed work blocks the calling thread for the delay.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentThread;

impl Scheduler for CurrentThread {
    fn schedule(&self, work: Work) {
        work();
    }

    fn schedule_after(&self, delay: Duration, work: Work) {
        thread::sleep(delay);
        work();
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn current_thread_runs_inline() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        CurrentThread.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[test]
    fn current_thread_delay() {
        let start = CurrentThread.now();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        CurrentThread.schedule_after(Duration::from_millis(10), Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(1, count.load(Ordering::SeqCst));
        assert!(CurrentThread.now() - start >= Duration::from_millis(10));
    }
}
