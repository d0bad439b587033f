use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tao_log::{debug, trace};

use crate::{
    BoxError, ExecuteError, Failure, Gate, Subject, Subscription,
};

/// The publishing half of a command: a multicast output stream of results
/// and a multicast error stream of failures.
pub struct Pipeline<T> {
    outputs: Subject<T>,
    errors: Subject<Failure>,
}

impl<T: 'static> Pipeline<T> {
    pub fn new() -> Pipeline<T> {
        Pipeline { outputs: Subject::new(), errors: Subject::new() }
    }

    /// Return the output stream.
    pub fn outputs(&self) -> &Subject<T> {
        &self.outputs
    }

    /// Return the error stream.
    pub fn errors(&self) -> &Subject<Failure> {
        &self.errors
    }

    /// Publish a successful result to all output observers.
    ///
    /// If any observer panics, the remaining observers still receive the
    /// value, and the panic is routed as with [`fail`](Pipeline::fail).
    pub fn publish(&self, value: &T) -> Result<(), Failure> {
        match self.outputs.publish(value) {
            Ok(()) => Ok(()),
            Err(panic) => self.fail(panic),
        }
    }

    /// Publish a failure to the error observers.
    ///
    /// If there are no error observers, the failure is returned instead, for
    /// the caller to propagate.
    pub fn fail(&self, failure: Failure) -> Result<(), Failure> {
        if self.errors.has_observers() {
            trace!("Pipeline::fail: publishing {}", failure);
            self.errors.publish(&failure).ok();
            Ok(())
        } else {
            Err(failure)
        }
    }

    /// Publish an invocation outcome, per [`publish`](Pipeline::publish) or
    /// [`fail`](Pipeline::fail).
    pub fn deliver(&self, outcome: Result<T, Failure>) -> Result<(), Failure> {
        match outcome {
            Ok(v) => self.publish(&v),
            Err(f) => self.fail(f),
        }
    }
}

impl<T: 'static> Default for Pipeline<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("outputs", &self.outputs)
            .field("errors", &self.errors)
            .finish()
    }
}

/// Run a handler, converting both its error and any panic into a `Failure`.
pub(crate) fn invoke<P, T, F>(f: &F, param: P) -> Result<T, Failure>
    where F: Fn(P) -> Result<T, BoxError> + ?Sized
{
    match catch_unwind(AssertUnwindSafe(|| f(param))) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(Failure::new(e)),
        Err(payload) => Err(Failure::from_panic(payload)),
    }
}

type Handler<P, T> = Box<dyn Fn(P) -> Result<T, BoxError> + Send + Sync>;

/// A synchronous command.
///
/// The handler runs on the calling thread of [`execute`](Command::execute),
/// and its result is published to the [`outputs`](Command::outputs) stream
/// before `execute` returns.
pub struct Command<P, T> {
    gate: Arc<Gate>,
    pipeline: Pipeline<T>,
    handler: Handler<P, T>,
    _following: Option<Subscription>,
}

/// A builder for [`Command`].
#[derive(Debug, Default)]
pub struct CommandBuilder {
    can_execute: Option<Subject<bool>>,
    initial: bool,
}

impl<P, T> Command<P, T>
    where P: 'static, T: 'static
{
    /// Create an always executable command with the given handler.
    pub fn new<F>(handler: F) -> Command<P, T>
        where F: Fn(P) -> Result<T, BoxError> + Send + Sync + 'static
    {
        CommandBuilder::new().create(handler)
    }

    /// Return true if the command may currently execute.
    pub fn can_execute(&self) -> bool {
        self.gate.can_execute()
    }

    /// Return true while the handler is running.
    pub fn is_executing(&self) -> bool {
        self.gate.is_executing()
    }

    /// Execute the handler with param, publishing its outcome.
    ///
    /// A failure (handler error, or panic of the handler or an output
    /// observer) is published on the [`errors`](Command::errors) stream, or
    /// returned as `ExecuteError::Failed` if that stream has no observers.
    /// Either way, the command remains usable for subsequent invocations.
    pub fn execute(&self, param: P) -> Result<(), ExecuteError> {
        self.gate.enter()?;
        trace!("Command::execute entered");
        let res = self.pipeline.deliver(invoke(&*self.handler, param));
        self.gate.exit();
        if let Err(ref e) = res {
            debug!("Command::execute: unobserved failure: {}", e);
        }
        res.map_err(ExecuteError::Failed)
    }

    /// Register an observer of can-execute changes.
    ///
    /// The observer is first called with the current value, then on each
    /// distinct change.
    pub fn can_execute_changed<F>(&self, f: F) -> Subscription
        where F: Fn(&bool) + Send + Sync + 'static
    {
        self.gate.subscribe_changed(f)
    }

    /// Return the output stream.
    pub fn outputs(&self) -> &Subject<T> {
        self.pipeline.outputs()
    }

    /// Return the error stream.
    pub fn errors(&self) -> &Subject<Failure> {
        self.pipeline.errors()
    }
}

impl<T> Command<T, T>
    where T: 'static
{
    /// Create an always executable command which publishes its parameter.
    pub fn passthrough() -> Command<T, T> {
        Command::new(Ok)
    }
}

impl<P, T> fmt::Debug for Command<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("gate", &self.gate)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl CommandBuilder {
    /// Create new command builder, for configuration.
    pub fn new() -> CommandBuilder {
        CommandBuilder { can_execute: None, initial: false }
    }

    /// Set a source of external enable values.
    ///
    /// Default: None, always enabled
    pub fn can_execute(&mut self, source: &Subject<bool>) -> &mut Self {
        self.can_execute = Some(source.clone());
        self
    }

    /// Set the external enable value assumed until the
    /// [`can_execute`](CommandBuilder::can_execute) source publishes.
    ///
    /// Default: false
    pub fn initial_can_execute(&mut self, enabled: bool) -> &mut Self {
        self.initial = enabled;
        self
    }

    /// Create a new [`Command`] with the given handler.
    pub fn create<P, T, F>(&mut self, handler: F) -> Command<P, T>
        where F: Fn(P) -> Result<T, BoxError> + Send + Sync + 'static,
              P: 'static,
              T: 'static
    {
        let (gate, following) = gated(0, self.can_execute.as_ref(), self.initial);
        Command {
            gate,
            pipeline: Pipeline::new(),
            handler: Box::new(handler),
            _following: following,
        }
    }
}

// Construct a gate, following the external source if provided.
pub(crate) fn gated(
    max_concurrent: usize,
    source: Option<&Subject<bool>>,
    initial: bool)
    -> (Arc<Gate>, Option<Subscription>)
{
    match source {
        Some(source) => {
            let gate = Arc::new(Gate::new(max_concurrent, initial));
            let following = gate.follow(source);
            (gate, Some(following))
        }
        None => (Arc::new(Gate::new(max_concurrent, true)), None),
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn log_init() {
        piccolog::test_logger();
    }

    fn collect<T: Clone + Send + 'static>(s: &Subject<T>)
        -> (Arc<Mutex<Vec<T>>>, Subscription)
    {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o2 = out.clone();
        (out, s.subscribe(move |v: &T| o2.lock().push(v.clone())))
    }

    #[test]
    fn passthrough_publishes_param() {
        log_init();
        let cmd: Command<&str, &str> = Command::passthrough();
        let (out, _sub) = collect(cmd.outputs());
        cmd.execute("a").unwrap();
        cmd.execute("b").unwrap();
        assert_eq!(vec!["a", "b"], *out.lock());
    }

    #[test]
    fn handler_error_to_error_stream() {
        log_init();
        let cmd = Command::new(|x: i32| -> Result<i32, BoxError> {
            if x % 2 == 0 {
                Err(format!("even: {}", x).into())
            } else {
                Ok(x * 10)
            }
        });
        let (out, _osub) = collect(cmd.outputs());
        let (errs, _esub) = collect(cmd.errors());
        for x in 1..=4 {
            cmd.execute(x).unwrap();
        }
        assert_eq!(vec![10, 30], *out.lock());
        let errs: Vec<_> = errs.lock().iter().map(|e| e.to_string()).collect();
        assert_eq!(vec!["even: 2", "even: 4"], errs);
    }

    #[test]
    fn unobserved_error_returned_to_caller() {
        log_init();
        let cmd = Command::new(|x: i32| -> Result<i32, BoxError> {
            if x == 2 { Err("two".into()) } else { Ok(x) }
        });
        let (out, _sub) = collect(cmd.outputs());
        assert!(cmd.execute(1).is_ok());
        match cmd.execute(2) {
            Err(ExecuteError::Failed(f)) => assert_eq!("two", f.to_string()),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!cmd.is_executing());
        assert!(cmd.execute(3).is_ok());
        assert_eq!(vec![1, 3], *out.lock());
    }

    #[test]
    fn handler_panic_isolated() {
        log_init();
        let cmd = Command::new(|x: i32| -> Result<i32, BoxError> {
            if x == 2 {
                panic!("handler panics on 2");
            }
            Ok(x)
        });
        let (out, _sub) = collect(cmd.outputs());
        let (errs, _esub) = collect(cmd.errors());
        for x in 1..=3 {
            cmd.execute(x).unwrap();
        }
        assert_eq!(vec![1, 3], *out.lock());
        assert!(errs.lock()[0].is_panic());
    }

    #[test]
    fn is_executing_during_handler() {
        log_init();
        let flag = Arc::new(Mutex::new(None::<Arc<Gate>>));
        let f2 = flag.clone();
        let cmd = Command::new(move |_: ()| -> Result<bool, BoxError> {
            let gate = f2.lock().clone();
            Ok(gate.map(|g| g.is_executing()).unwrap_or(false))
        });
        *flag.lock() = Some(cmd.gate.clone());
        let (out, _sub) = collect(cmd.outputs());
        cmd.execute(()).unwrap();
        assert_eq!(vec![true], *out.lock());
        assert!(!cmd.is_executing());
    }

    #[test]
    fn closed_gate_rejects() {
        log_init();
        let source = Subject::new();
        let cmd = CommandBuilder::new()
            .can_execute(&source)
            .create(|x: i32| -> Result<i32, BoxError> { Ok(x) });
        let (out, _sub) = collect(cmd.outputs());
        assert!(!cmd.can_execute());
        assert!(matches!(cmd.execute(1), Err(ExecuteError::GateClosed)));
        source.publish(&true).unwrap();
        assert!(cmd.can_execute());
        cmd.execute(2).unwrap();
        assert_eq!(vec![2], *out.lock());
    }

    #[test]
    fn initial_can_execute() {
        log_init();
        let source = Subject::new();
        let cmd: Command<(), ()> = CommandBuilder::new()
            .can_execute(&source)
            .initial_can_execute(true)
            .create(|_| Ok(()));
        assert!(cmd.can_execute());
        source.publish(&false).unwrap();
        assert!(!cmd.can_execute());
    }
}
