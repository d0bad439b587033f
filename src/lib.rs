//! Reactive commands: user-triggerable operations with observable output
//! and error streams, a derived can-execute state, and a bounded count of
//! concurrent executions.
//!
//! A synchronous [`Command`] runs its handler on the calling thread. An
//! [`AsyncCommand`] runs its registered function on the *worker* queue of
//! its [`Schedulers`] and publishes every value, failure, and state change
//! on the *result* queue. Memoized registrations share a
//! [`MemoizingCache`], which computes each key at most once while resolved
//! or in flight.
//!
//! Scheduling is explicit: [`Schedulers::threaded`] provides a
//! [`DispatchPool`] worker queue and a serial result queue, while
//! [`VirtualScheduler`] provides a manually advanced clock for
//! deterministic tests.
//!
//! ## Optional Features
//!
//! _futures-channel_ (default): Adds [`AsyncCommand::execute_rx`], returning
//! a [`Dispatched`] future of a single execution's outcome, and
//! [`Subject::stream`], returning a [`SubjectStream`] of published values.

#![warn(rust_2018_idioms)]

mod async_command;
mod cache;
mod dispatch_pool;
mod errors;
mod gate;
mod pipeline;
mod scheduler;
mod subject;
mod virtual_time;

#[cfg(feature = "futures-channel")]
mod dispatch;

#[cfg(feature = "futures-channel")]
mod subject_stream;

pub use async_command::{AsyncCommand, AsyncCommandBuilder};

pub use cache::{MemoizingCache, Waiter};

pub use dispatch_pool::{DispatchPool, DispatchPoolBuilder};

pub use errors::{BoxError, Canceled, ExecuteError, Failure, GateClosed};

pub use gate::Gate;

pub use pipeline::{Command, CommandBuilder, Pipeline};

pub use scheduler::{CurrentThread, Scheduler, Schedulers, Work};

pub use subject::{Event, Subject, Subscription, Termination};

pub use virtual_time::VirtualScheduler;

#[cfg(feature = "futures-channel")]
pub use dispatch::Dispatched;

#[cfg(feature = "futures-channel")]
pub use subject_stream::SubjectStream;
