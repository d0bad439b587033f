use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tao_log::{error, trace};

use crate::Failure;

/// An event delivered to observers registered via
/// [`Subject::subscribe_events`].
#[derive(Debug)]
pub enum Event<'a, T> {
    /// A published value.
    Next(&'a T),

    /// The subject completed normally. No further events follow.
    Completed,

    /// The subject failed. No further events follow.
    Failed(&'a Failure),
}

/// The terminal state of a [`Subject`].
#[derive(Clone, Debug)]
pub enum Termination {
    Completed,
    Failed(Failure),
}

type Observer<T> = Arc<dyn Fn(Event<'_, T>) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    observers: Vec<Entry<T>>,
    terminated: Option<Termination>,
}

struct Entry<T> {
    id: u64,
    active: Arc<AtomicBool>,
    observer: Observer<T>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Entry {
            id: self.id,
            active: self.active.clone(),
            observer: self.observer.clone(),
        }
    }
}

/// A multicast stream of values.
///
/// Each published value is delivered exactly once to every observer that is
/// registered at the time of publishing, in registration order. Delivery
/// iterates a snapshot of the registry, so observers may subscribe or
/// unsubscribe (including themselves) during delivery. An observer removed
/// during delivery is not called again, even for the value being delivered.
///
/// A `Subject` is a handle, and clones share the same registry.
pub struct Subject<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

/// A handle to an observer registration with a [`Subject`].
///
/// The observer is removed when this is dropped, or on
/// [`unsubscribe`](Subscription::unsubscribe).
#[must_use = "the observer is removed when the Subscription is dropped"]
pub struct Subscription {
    active: Arc<AtomicBool>,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subject<T>
    where T: 'static
{
    /// Create a new, active subject with no observers.
    pub fn new() -> Subject<T> {
        Subject {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                observers: Vec::new(),
                terminated: None,
            }))
        }
    }

    /// Register an observer of published values.
    ///
    /// Termination events are not delivered to this observer; see
    /// [`subscribe_events`](Subject::subscribe_events).
    pub fn subscribe<F>(&self, f: F) -> Subscription
        where F: Fn(&T) + Send + Sync + 'static
    {
        self.subscribe_events(move |ev| {
            if let Event::Next(v) = ev {
                f(v)
            }
        })
    }

    /// Register an observer of all events, including termination.
    ///
    /// If the subject has already terminated, the observer is immediately
    /// called with the terminal event, and the returned subscription is
    /// inert.
    pub fn subscribe_events<F>(&self, f: F) -> Subscription
        where F: Fn(Event<'_, T>) + Send + Sync + 'static
    {
        let mut reg = self.registry.lock();
        let terminated = reg.terminated.clone();
        if let Some(term) = terminated {
            drop(reg);
            trace!("Subject::subscribe_events: already terminated");
            match term {
                Termination::Completed => f(Event::Completed),
                Termination::Failed(ref e) => f(Event::Failed(e)),
            }
            return Subscription::inert();
        }

        let id = reg.next_id;
        reg.next_id += 1;
        let active = Arc::new(AtomicBool::new(true));
        reg.observers.push(Entry {
            id,
            active: active.clone(),
            observer: Arc::new(f),
        });
        drop(reg);

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            active,
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().observers.retain(|e| e.id != id);
                }
            })),
        }
    }

    /// Publish a value to all current observers.
    ///
    /// A panicking observer does not prevent delivery to the remaining
    /// observers. The first such panic is returned as a `Failure`, after
    /// delivery completes. Publishing to a terminated subject is ignored.
    pub fn publish(&self, value: &T) -> Result<(), Failure> {
        let observers = {
            let reg = self.registry.lock();
            if reg.terminated.is_some() {
                trace!("Subject::publish: ignored after termination");
                return Ok(());
            }
            reg.observers.clone()
        };
        deliver(&observers, || Event::Next(value))
    }

    /// Complete the subject, notifying and then removing all observers.
    ///
    /// Returns false if the subject was already terminated.
    pub fn complete(&self) -> bool {
        self.terminate(Termination::Completed)
    }

    /// Fail the subject, notifying and then removing all observers.
    ///
    /// Returns false if the subject was already terminated.
    pub fn fail(&self, failure: Failure) -> bool {
        self.terminate(Termination::Failed(failure))
    }

    /// Return the terminal state, if terminated.
    pub fn termination(&self) -> Option<Termination> {
        self.registry.lock().terminated.clone()
    }

    /// Return the number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.registry.lock().observers.len()
    }

    /// Return true if any observer is registered.
    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }

    fn terminate(&self, term: Termination) -> bool {
        let observers = {
            let mut reg = self.registry.lock();
            if reg.terminated.is_some() {
                return false;
            }
            reg.terminated = Some(term.clone());
            std::mem::replace(&mut reg.observers, Vec::new())
        };
        let res = match term {
            Termination::Completed => deliver(&observers, || Event::Completed),
            Termination::Failed(ref e) => deliver(&observers, || Event::Failed(e)),
        };
        if let Err(e) = res {
            error!("Subject: observer panicked on termination: {}", e);
        }
        true
    }
}

fn deliver<'a, T, E>(observers: &[Entry<T>], event: E) -> Result<(), Failure>
    where E: Fn() -> Event<'a, T>, T: 'a
{
    let mut first_panic = None;
    for entry in observers {
        if !entry.active.load(Ordering::SeqCst) {
            continue;
        }
        let observer = &entry.observer;
        let res = catch_unwind(AssertUnwindSafe(|| observer(event())));
        if let Err(payload) = res {
            let failure = Failure::from_panic(payload);
            error!("Subject: observer {} panicked: {}", entry.id, failure);
            if first_panic.is_none() {
                first_panic = Some(failure);
            }
        }
    }
    match first_panic {
        Some(f) => Err(f),
        None => Ok(()),
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Subject { registry: self.registry.clone() }
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.registry.lock();
        f.debug_struct("Subject")
            .field("observers", &reg.observers.len())
            .field("terminated", &reg.terminated)
            .finish()
    }
}

impl Subscription {
    fn inert() -> Subscription {
        Subscription { active: Arc::new(AtomicBool::new(false)), remove: None }
    }

    /// Remove the observer. Equivalent to dropping this handle.
    pub fn unsubscribe(self) {
        drop(self)
    }

    /// Return true if the observer is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
