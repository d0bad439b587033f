use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tao_log::{error, trace, warn};

use crate::pipeline::{gated, invoke};
use crate::{
    BoxError, Canceled, Failure, Gate, GateClosed, MemoizingCache, Pipeline,
    Schedulers, Subject, Subscription,
};

type Unit<P, T> = Arc<dyn Fn(P, Completion<T>) + Send + Sync>;

type Finish<T> = Box<dyn FnOnce(Vec<T>, Option<Failure>) + Send>;

pub(crate) type Reply<T> = Box<dyn FnOnce(Result<Vec<T>, Failure>) + Send>;

/// A command whose registered function runs on a worker queue, with its
/// outcome published from a result queue.
///
/// Each [`execute`](AsyncCommand::execute) atomically checks the gate and
/// increments the in-flight count, on the calling thread, then schedules the
/// function on the worker queue and returns. When the function completes, its
/// values (or failure) are published on the result queue, and only then is
/// the in-flight count decremented. With a concurrency ceiling of N, the
/// command can not execute while N executions are in flight.
///
/// Construct via [`AsyncCommandBuilder`].
pub struct AsyncCommand<P, T> {
    shared: Arc<Shared<T>>,
    unit: Unit<P, T>,
    _following: Option<Subscription>,
}

struct Shared<T> {
    gate: Arc<Gate>,
    pipeline: Pipeline<T>,
    schedulers: Schedulers,
}

/// A builder for [`AsyncCommand`], terminated by one of the `register_*`
/// methods.
#[derive(Debug)]
pub struct AsyncCommandBuilder {
    schedulers: Schedulers,
    max_concurrent: usize,
    can_execute: Option<Subject<bool>>,
    initial: bool,
}

// Obligation to complete a single execution. If dropped without completing,
// for example by a scheduler discarding queued work, the execution completes
// as `Canceled`, so the in-flight count is always released.
pub(crate) struct Completion<T> {
    finish: Option<Finish<T>>,
}

impl<T> Completion<T> {
    fn complete(mut self, values: Vec<T>, failure: Option<Failure>) {
        if let Some(finish) = self.finish.take() {
            finish(values, failure);
        }
    }

    fn resolve(self, outcome: Result<T, Failure>) {
        match outcome {
            Ok(v) => self.complete(vec![v], None),
            Err(e) => self.complete(Vec::new(), Some(e)),
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(finish) = self.finish.take() {
            warn!("AsyncCommand: work dropped before completion");
            finish(Vec::new(), Some(Failure::from(Canceled)));
        }
    }
}

impl<T> Shared<T>
    where T: Send + 'static
{
    // Runs on the result queue.
    fn deliver(
        &self,
        values: Vec<T>,
        failure: Option<Failure>,
        reply: Option<Reply<T>>)
    {
        for v in &values {
            if let Err(e) = self.pipeline.publish(v) {
                error!("AsyncCommand: unobserved output observer failure: {}", e);
            }
        }
        let outcome = match failure {
            Some(f) => {
                if let Err(e) = self.pipeline.fail(f.clone()) {
                    error!("AsyncCommand: unobserved failure: {}", e);
                }
                Err(f)
            }
            None => Ok(values),
        };
        let n = self.gate.exit();
        trace!("AsyncCommand: delivered, {} in flight", n);
        if let Some(reply) = reply {
            reply(outcome);
        }
    }
}

impl<P, T> AsyncCommand<P, T>
    where P: Send + 'static,
          T: Send + 'static
{
    /// Return true if the command may currently execute.
    pub fn can_execute(&self) -> bool {
        self.shared.gate.can_execute()
    }

    /// Execute the registered function with param.
    ///
    /// This returns once the work is scheduled. Fails with `GateClosed`,
    /// without scheduling anything, if the command can not currently
    /// execute.
    pub fn execute(&self, param: P) -> Result<(), GateClosed> {
        self.submit(param, None)
    }

    pub(crate) fn submit(&self, param: P, reply: Option<Reply<T>>)
        -> Result<(), GateClosed>
    {
        let n = self.shared.gate.enter()?;
        trace!("AsyncCommand::execute: {} in flight", n);

        let shared = self.shared.clone();
        let done = Completion {
            finish: Some(Box::new(move |values: Vec<T>, failure: Option<Failure>| {
                let result = shared.schedulers.result().clone();
                result.schedule(Box::new(move || {
                    shared.deliver(values, failure, reply)
                }));
            }))
        };
        let unit = self.unit.clone();
        self.shared.schedulers.worker().schedule(Box::new(move || {
            unit(param, done)
        }));
        Ok(())
    }

    /// Register an observer of can-execute changes.
    ///
    /// The observer is first called with the current value, then on each
    /// distinct change.
    pub fn can_execute_changed<F>(&self, f: F) -> Subscription
        where F: Fn(&bool) + Send + Sync + 'static
    {
        self.shared.gate.subscribe_changed(f)
    }

    /// Return the output stream.
    pub fn outputs(&self) -> &Subject<T> {
        self.shared.pipeline.outputs()
    }

    /// Return the error stream.
    pub fn errors(&self) -> &Subject<Failure> {
        self.shared.pipeline.errors()
    }

    /// Return the number of executions in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.gate.in_flight()
    }

    /// Return the stream of in-flight counts, published on each change.
    pub fn in_flight_changes(&self) -> &Subject<usize> {
        self.shared.gate.in_flight_changes()
    }

    /// Return true if any execution is in flight.
    pub fn is_executing(&self) -> bool {
        self.shared.gate.is_executing()
    }

    /// Return the concurrency ceiling, where 0 is unbounded.
    pub fn max_concurrent(&self) -> usize {
        self.shared.gate.max_concurrent()
    }
}

impl<P, T> fmt::Debug for AsyncCommand<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCommand")
            .field("gate", &self.shared.gate)
            .field("pipeline", &self.shared.pipeline)
            .finish()
    }
}

impl AsyncCommandBuilder {
    /// Create new async command builder, for configuration.
    pub fn new(schedulers: Schedulers) -> AsyncCommandBuilder {
        AsyncCommandBuilder {
            schedulers,
            max_concurrent: 0,
            can_execute: None,
            initial: false,
        }
    }

    /// Set the maximum number of executions in flight.
    ///
    /// Default: 0, unbounded
    pub fn max_concurrent(&mut self, max: usize) -> &mut Self {
        self.max_concurrent = max;
        self
    }

    /// Set a source of external enable values.
    ///
    /// Default: None, always enabled
    pub fn can_execute(&mut self, source: &Subject<bool>) -> &mut Self {
        self.can_execute = Some(source.clone());
        self
    }

    /// Set the external enable value assumed until the
    /// [`can_execute`](AsyncCommandBuilder::can_execute) source publishes.
    ///
    /// Default: false
    pub fn initial_can_execute(&mut self, enabled: bool) -> &mut Self {
        self.initial = enabled;
        self
    }

    /// Register a function producing a single value per execution.
    pub fn register<P, T, F>(&mut self, f: F) -> AsyncCommand<P, T>
        where F: Fn(P) -> Result<T, BoxError> + Send + Sync + 'static,
              P: Send + 'static,
              T: Send + 'static
    {
        self.create(Arc::new(move |p: P, done: Completion<T>| {
            done.resolve(invoke(&f, p))
        }))
    }

    /// Register a function with no output value, other than completion.
    pub fn register_action<P, F>(&mut self, f: F) -> AsyncCommand<P, ()>
        where F: Fn(P) -> Result<(), BoxError> + Send + Sync + 'static,
              P: Send + 'static
    {
        self.register(f)
    }

    /// Register a function producing zero or more values per execution.
    ///
    /// The sequence is consumed on the worker queue. All of its values are
    /// published before the in-flight count is released. If the function or
    /// its iteration fails, values produced beforehand are still published,
    /// followed by the failure.
    pub fn register_sequence<P, T, I, F>(&mut self, f: F) -> AsyncCommand<P, T>
        where F: Fn(P) -> Result<I, BoxError> + Send + Sync + 'static,
              I: IntoIterator<Item = T>,
              P: Send + 'static,
              T: Send + 'static
    {
        self.create(Arc::new(move |p: P, done: Completion<T>| {
            let mut values = Vec::new();
            let res = catch_unwind(AssertUnwindSafe(|| -> Result<(), BoxError> {
                for v in f(p)? {
                    values.push(v);
                }
                Ok(())
            }));
            let failure = match res {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Failure::new(e)),
                Err(payload) => Some(Failure::from_panic(payload)),
            };
            done.complete(values, failure)
        }))
    }

    /// Register a function memoized by its parameter, in a new cache of the
    /// given capacity.
    ///
    /// See [`register_cached`](AsyncCommandBuilder::register_cached).
    pub fn register_memoized<P, T, F>(&mut self, capacity: usize, f: F)
        -> AsyncCommand<P, T>
        where F: Fn(P) -> Result<T, BoxError> + Send + Sync + 'static,
              P: Clone + Eq + Hash + Send + Sync + 'static,
              T: Clone + Send + Sync + 'static
    {
        let cache = Arc::new(MemoizingCache::new(capacity));
        self.register_cached(cache, P::clone, f)
    }

    /// Register a function memoized via the given cache, keyed by the key
    /// selector applied to each parameter.
    ///
    /// Executions with a key already cached publish the cached value without
    /// calling the function. Executions with a key whose computation is in
    /// progress publish its value when that completes. Failures are published
    /// to every execution sharing the computation, and are not cached.
    pub fn register_cached<P, K, T, KF, F>(
        &mut self,
        cache: Arc<MemoizingCache<K, T>>,
        key: KF,
        f: F)
        -> AsyncCommand<P, T>
        where F: Fn(P) -> Result<T, BoxError> + Send + Sync + 'static,
              KF: Fn(&P) -> K + Send + Sync + 'static,
              K: Eq + Hash + Clone + Send + Sync + 'static,
              P: Send + 'static,
              T: Clone + Send + Sync + 'static
    {
        self.create(Arc::new(move |p: P, done: Completion<T>| {
            let k = key(&p);
            let f = &f;
            cache.fetch(
                k,
                Box::new(move |outcome: Result<T, Failure>| done.resolve(outcome)),
                || invoke(f, p));
        }))
    }

    fn create<P, T>(&mut self, unit: Unit<P, T>) -> AsyncCommand<P, T>
        where T: 'static
    {
        let (gate, following) = gated(
            self.max_concurrent,
            self.can_execute.as_ref(),
            self.initial);
        AsyncCommand {
            shared: Arc::new(Shared {
                gate,
                pipeline: Pipeline::new(),
                schedulers: self.schedulers.clone(),
            }),
            unit,
            _following: following,
        }
    }
}
