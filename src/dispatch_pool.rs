use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tao_log::{debug, error, trace};
use crossbeam_channel as cbch;

use crate::scheduler::{Scheduler, Work};

/// A thread pool and queue implementing [`Scheduler`].
///
/// This simple pool is _not_ an executor and doesn't need any "waking" or
/// "parking" facilities. By default it uses an unbounded MPMC channel with the
/// assumption that resource/capacity is externally constrained, for example by
/// an [`AsyncCommand`](crate::AsyncCommand) concurrency ceiling. Once
/// constructed, a fixed number of threads are spawned and the instance acts as
/// a handle to the pool. This may be inexpensively cloned for additional
/// handles to the same pool.
///
/// A pool of size one runs its work strictly in submission order, which makes
/// it suitable as a command _result_ queue.
#[derive(Clone)]
pub struct DispatchPool {
    sender: Arc<Sender>,
    catch_unwind: bool,
    run_on_caller: bool
}

#[derive(Debug)]
struct Sender {
    tx: cbch::Sender<Job>,
    counter: Arc<AtomicUsize>,
    name_prefix: String,
}

type AroundFn = Arc<dyn Fn(usize) + Send + Sync>;

/// A builder for [`DispatchPool`] supporting various configuration.
pub struct DispatchPoolBuilder {
    pool_size: Option<usize>,
    queue_length: Option<usize>,
    stack_size: Option<usize>,
    name_prefix: Option<String>,
    after_start: Option<AroundFn>,
    before_stop: Option<AroundFn>,
    catch_unwind: bool
}

enum Job {
    Count,
    Unit(Work),
    SafeUnit(Work),
    Terminate,
}

impl DispatchPool {
    /// Create new pool using defaults.
    pub fn new() -> DispatchPool {
        DispatchPoolBuilder::default().create()
    }

    /// Create a new builder for configuring a new pool.
    pub fn builder() -> DispatchPoolBuilder {
        DispatchPoolBuilder::new()
    }

    /// Enqueue work to be executed by a pool thread.
    ///
    /// This first attempts to send to the associated queue, which will always
    /// succeed if _unbounded_, e.g. no [`DispatchPoolBuilder::queue_length`]
    /// is set, the default. If however the queue is _bounded_ and full, or the
    /// pool is configured with zero (pool_size) threads, the work is directly
    /// run by the _calling_ thread.
    pub fn spawn(&self, f: Work) {
        if self.run_on_caller {
            f();
            return;
        }

        let job = if self.catch_unwind {
            Job::SafeUnit(f)
        } else {
            Job::Unit(f)
        };

        match self.sender.tx.try_send(job) {
            Err(cbch::TrySendError::Full(Job::Unit(f))) |
            Err(cbch::TrySendError::Full(Job::SafeUnit(f))) => {
                debug!("DispatchPool::spawn: queue is full, \
                        running on calling thread!");
                f();
            }
            Err(cbch::TrySendError::Disconnected(Job::Unit(f))) |
            Err(cbch::TrySendError::Disconnected(Job::SafeUnit(f))) => {
                error!("DispatchPool::spawn: no pool threads remain, \
                        running on calling thread!");
                f();
            }
            Err(_) => unreachable!("only work units are spawned"),
            Ok(()) => {}
        }
    }

    /// Return the number of running pool threads.
    pub fn threads(&self) -> usize {
        self.sender.counter.load(Ordering::SeqCst)
    }
}

impl Scheduler for DispatchPool {
    fn schedule(&self, work: Work) {
        self.spawn(work);
    }

    /// Delayed work is held by a dedicated timer thread, and only enters the
    /// pool queue once the delay has elapsed, so pool threads never sleep on
    /// its behalf.
    fn schedule_after(&self, delay: Duration, work: Work) {
        if delay == Duration::from_secs(0) {
            self.spawn(work);
            return;
        }
        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}timer", self.sender.name_prefix))
            .spawn(move || {
                thread::sleep(delay);
                pool.spawn(work);
            });
        if let Err(e) = spawned {
            // The work (and anything it owns) is dropped with the closure.
            error!("DispatchPool::schedule_after: timer thread spawn: {}", e);
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

// Guard type that decrements pool size on drop, including on abnormal unwind.
struct Turnstile {
    index: usize,
    counter: Arc<AtomicUsize>,
    before_stop: Option<AroundFn>
}

impl Turnstile {
    fn increment(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Turnstile {
    fn drop(&mut self) {
        trace!("Turnstile::drop entered");
        self.counter.fetch_sub(1, Ordering::SeqCst);
        if let Some(bsfn) = &self.before_stop {
            bsfn(self.index);
        }
    }
}

fn work(
    index: usize,
    counter: Arc<AtomicUsize>,
    after_start: Option<AroundFn>,
    before_stop: Option<AroundFn>,
    rx: cbch::Receiver<Job>)
{
    if let Some(ref asfn) = after_start {
        asfn(index);
    }
    drop(after_start);

    {
        let ts = Turnstile { index, counter, before_stop };
        let rx = rx; // move here so it drops before ts.
        loop {
            match rx.recv() {
                Ok(Job::Count) => ts.increment(),
                Ok(Job::Unit(bfn)) => bfn(),
                Ok(Job::SafeUnit(bfn)) => {
                    if catch_unwind(AssertUnwindSafe(bfn)).is_err() {
                        error!("DispatchPool: panic was caught, ignored");
                    }
                }
                Ok(Job::Terminate) | Err(_) => break,
            }
        }
    }
}

impl Default for DispatchPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        trace!("Sender::drop entered");
        let threads = self.counter.load(Ordering::SeqCst);
        let mut terms = 0;
        for _ in 0..threads {
            if let Err(e) = self.tx.try_send(Job::Terminate) {
                trace!("Sender::drop on terminate send: {}", e);
                break;
            }
            terms += 1;
        }
        // This intentionally only yields a number of times equivalent to the
        // termination messages sent, to avoid any risk of hanging.
        for _ in 0..terms {
            let size = self.counter.load(Ordering::SeqCst);
            if size > 0 {
                trace!("Sender::drop yielding, pool size: {}", size);
                thread::yield_now();
            } else {
                break;
            }
        }
    }
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("name_prefix", &self.sender.name_prefix)
            .field("threads", &self.sender.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Count => write!(f, "Count"),
            Job::Unit(_) => write!(f, "Unit"),
            Job::SafeUnit(_) => write!(f, "SafeUnit"),
            Job::Terminate => write!(f, "Terminate"),
        }
    }
}

impl DispatchPoolBuilder {
    /// Create new dispatch pool builder, for configuration.
    pub fn new() -> DispatchPoolBuilder {
        DispatchPoolBuilder {
            pool_size: None,
            queue_length: None,
            stack_size: None,
            name_prefix: None,
            after_start: None,
            before_stop: None,
            catch_unwind: true
        }
    }

    /// Set the fixed number of threads in the pool.
    ///
    /// A size of one (1) yields a serial queue. This may also be zero, in
    /// which case, all work is executed on the _calling thread_, see
    /// [`DispatchPool::spawn`].
    ///
    /// Default: the number of logical CPU's, minus one, if more than
    /// one.
    pub fn pool_size(&mut self, size: usize) -> &mut Self {
        self.pool_size = Some(size);
        self
    }

    /// Set the length (aka maximum capacity or depth) of the associated
    /// work queue.
    ///
    /// Note that if this length is ever exceeded, work will be executed on
    /// the _calling thread_, see [`DispatchPool::spawn`].  A length of
    /// zero (0) is an accepted value, and guarantees work will be run
    /// _immediately_ by a pool thread, or the calling thread.
    ///
    /// Default: unbounded
    pub fn queue_length(&mut self, length: usize) -> &mut Self {
        self.queue_length = Some(length);
        self
    }

    /// Set whether to catch unwinds for work that panics.
    ///
    /// If set false, pool threads will terminate on panic unwind, and
    /// currently they are not re-spawned.
    ///
    /// Default: true
    pub fn catch_unwind(&mut self, do_catch: bool) -> &mut Self {
        self.catch_unwind = do_catch;
        self
    }

    /// Set the stack size in bytes for each thread in the pool.
    ///
    /// Default: the default thread stack size.
    pub fn stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Set name prefix for threads in the pool.
    ///
    /// Default: "rcmd-pool-N-" where N is a 0-based static pool counter
    pub fn name_prefix<S: Into<String>>(&mut self, name_prefix: S) -> &mut Self {
        self.name_prefix = Some(name_prefix.into());
        self
    }

    /// Set a closure to be called immediately after each thread is started.
    ///
    /// The closure is passed a 0-based index of the thread.
    ///
    /// Default: None
    pub fn after_start<F>(&mut self, f: F) -> &mut Self
        where F: Fn(usize) + Send + Sync + 'static
    {
        self.after_start = Some(Arc::new(f));
        self
    }

    /// Set a closure to be called immediately before a pool thread exits.
    ///
    /// The closure is passed a 0-based index of the thread.
    ///
    /// Default: None
    pub fn before_stop<F>(&mut self, f: F) -> &mut Self
        where F: Fn(usize) + Send + Sync + 'static
    {
        self.before_stop = Some(Arc::new(f));
        self
    }

    /// Create a new [`DispatchPool`](DispatchPool) with the provided
    /// configuration.
    ///
    /// ## Panics
    ///
    /// Panics if a pool thread can not be spawned.
    pub fn create(&mut self) -> DispatchPool {

        let (tx, rx) = if let Some(len) = self.queue_length {
            cbch::bounded(len)
        } else {
            cbch::unbounded()
        };

        let pool_size = if let Some(size) = self.pool_size {
            size
        } else {
            let mut size = num_cpus::get();
            if size > 1 {
                size -= 1;
            }
            size
        };

        static POOL_CNT: AtomicUsize = AtomicUsize::new(0);
        let name_prefix = if let Some(ref prefix) = self.name_prefix {
            prefix.to_owned()
        } else {
            format!(
                "rcmd-pool-{}-",
                POOL_CNT.fetch_add(1, Ordering::SeqCst))
        };

        let sender = Sender {
            tx,
            counter: Arc::new(AtomicUsize::new(0)),
            name_prefix: name_prefix.clone(),
        };

        for i in 0..pool_size {
            let after_start = self.after_start.clone();
            let before_stop = self.before_stop.clone();
            let rx = rx.clone();

            let mut builder = thread::Builder::new();
            builder = builder.name(format!("{}{}", name_prefix, i));
            if let Some(size) = self.stack_size {
                builder = builder.stack_size(size);
            }
            let cnt = sender.counter.clone();
            builder
                .spawn(move || work(i, cnt, after_start, before_stop, rx))
                .expect("DispatchPoolBuilder::create thread spawn");

            // Send a job to count the new thread, possibly blocking if
            // bounded, until _some_ thread is available.
            sender.tx.send(Job::Count).expect("success blank");
        }

        // Wait until counter reaches pool size. This is not particularly a
        // guarantee of _all_ threads, but does guarantee _one_ thread,
        // which is material for the zero queue length case.
        while sender.counter.load(Ordering::SeqCst) < pool_size {
            thread::yield_now();
        }

        debug!("DispatchPool {}* created with {} threads",
               name_prefix, pool_size);

        DispatchPool {
            sender: Arc::new(sender),
            catch_unwind: self.catch_unwind,
            run_on_caller: (pool_size == 0)
        }
    }
}

impl Default for DispatchPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crossbeam_channel as cbch;

    use super::*;

    fn log_init() {
        piccolog::test_logger();
    }

    #[test]
    fn serial_pool_preserves_order() {
        log_init();
        let pool = DispatchPool::builder()
            .pool_size(1)
            .after_start(|i| debug!("starting serial pool thread {}", i))
            .before_stop(|i| debug!("dropping serial pool thread {}", i))
            .create();
        assert_eq!(1, pool.threads());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = cbch::unbounded();
        for i in 0..100 {
            let seen = seen.clone();
            let tx = tx.clone();
            pool.schedule(Box::new(move || {
                seen.lock().unwrap().push(i);
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..100 {
            rx.recv().unwrap();
        }
        let seen = seen.lock().unwrap();
        assert_eq!((0..100).collect::<Vec<_>>(), *seen);
    }

    #[test]
    fn zero_size_runs_on_caller() {
        log_init();
        let pool = DispatchPool::builder().pool_size(0).create();
        let caller = thread::current().id();
        let (tx, rx) = cbch::bounded(1);
        pool.schedule(Box::new(move || {
            tx.send(thread::current().id()).unwrap();
        }));
        assert_eq!(caller, rx.try_recv().unwrap());
    }

    #[test]
    fn panic_is_caught() {
        log_init();
        let pool = DispatchPool::builder().pool_size(1).create();
        pool.schedule(Box::new(|| panic!("expected test panic")));
        let (tx, rx) = cbch::bounded(1);
        pool.schedule(Box::new(move || tx.send(41).unwrap()));
        assert_eq!(41, rx.recv().unwrap());
        assert_eq!(1, pool.threads());
    }

    #[test]
    fn delayed_schedule() {
        log_init();
        let pool = DispatchPool::builder().pool_size(2).create();
        let start = pool.now();
        let (tx, rx) = cbch::bounded(1);
        pool.schedule_after(Duration::from_millis(20), Box::new(move || {
            tx.send(Instant::now()).unwrap();
        }));
        let ran = rx.recv().unwrap();
        assert!(ran - start >= Duration::from_millis(20));
    }
}
