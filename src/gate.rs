use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tao_log::{debug, warn};

use crate::{GateClosed, Subject, Subscription};

/// Combines an external enable signal with an in-flight count and
/// concurrency ceiling, into a single de-duplicated "can execute" signal.
///
/// The combined value is `external && (max_concurrent == 0 || in_flight <
/// max_concurrent)`. Change notifications are only published when the
/// combined value differs from the last one published. All state changes and
/// their notifications are serialized per gate, so observers see changes in
/// the order they actually occurred. Observers may query the gate, or
/// execute its command, from within a notification.
pub struct Gate {
    state: Mutex<GateState>,
    notify: ReentrantMutex<()>,
    changed: Subject<bool>,
    in_flight: Subject<usize>,
}

#[derive(Debug)]
struct GateState {
    external: bool,
    in_flight: usize,
    max_concurrent: usize,
    last: bool,
}

impl GateState {
    fn combined(&self) -> bool {
        self.external &&
            (self.max_concurrent == 0 || self.in_flight < self.max_concurrent)
    }
}

impl Gate {
    /// Create a gate with the given concurrency ceiling (0 is unbounded) and
    /// initial external value.
    pub fn new(max_concurrent: usize, external: bool) -> Gate {
        let mut state = GateState {
            external,
            in_flight: 0,
            max_concurrent,
            last: false,
        };
        state.last = state.combined();
        Gate {
            state: Mutex::new(state),
            notify: ReentrantMutex::new(()),
            changed: Subject::new(),
            in_flight: Subject::new(),
        }
    }

    /// Compute the combined value from current inputs.
    pub fn evaluate(&self) -> bool {
        self.state.lock().combined()
    }

    /// Return the last published combined value.
    pub fn can_execute(&self) -> bool {
        self.state.lock().last
    }

    /// Return the current in-flight count.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Return true if any execution is in flight.
    pub fn is_executing(&self) -> bool {
        self.in_flight() > 0
    }

    /// Return the concurrency ceiling, where 0 is unbounded.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    /// Set the external enable signal.
    pub fn set_external(&self, enabled: bool) {
        self.update(|st| st.external = enabled);
    }

    /// Atomically check the gate and increment the in-flight count,
    /// returning the new count.
    ///
    /// Fails with `GateClosed`, leaving the count unchanged, if the gate is
    /// closed.
    pub fn enter(&self) -> Result<usize, GateClosed> {
        self.update(|st| {
            if st.combined() {
                st.in_flight += 1;
                Ok(st.in_flight)
            } else {
                Err(GateClosed)
            }
        })
    }

    /// Decrement the in-flight count, returning the new count.
    ///
    /// The count never goes below zero: an exit without a matching
    /// [`enter`](Gate::enter) is logged and otherwise ignored.
    pub fn exit(&self) -> usize {
        self.update(|st| {
            if st.in_flight == 0 {
                warn!("Gate::exit without matching enter, ignored");
            } else {
                st.in_flight -= 1;
            }
            st.in_flight
        })
    }

    /// Register an observer of combined value changes.
    ///
    /// The observer is first called with the current value, then with each
    /// distinct change.
    pub fn subscribe_changed<F>(&self, f: F) -> Subscription
        where F: Fn(&bool) + Send + Sync + 'static
    {
        let _notify = self.notify.lock();
        let current = self.state.lock().last;
        f(&current);
        self.changed.subscribe(f)
    }

    /// Return the subject of distinct combined value changes, without replay
    /// of the current value.
    pub fn changes(&self) -> &Subject<bool> {
        &self.changed
    }

    /// Return the subject publishing each new in-flight count.
    pub fn in_flight_changes(&self) -> &Subject<usize> {
        &self.in_flight
    }

    /// Follow a source of external enable values.
    ///
    /// The gate is held weakly, and following ends when the returned
    /// subscription is dropped.
    pub fn follow(self: &Arc<Self>, source: &Subject<bool>) -> Subscription {
        let weak = Arc::downgrade(self);
        source.subscribe(move |enabled| {
            if let Some(gate) = weak.upgrade() {
                gate.set_external(*enabled);
            }
        })
    }

    // Apply a state change and publish its consequences, all while holding
    // the notify lock, so that publications are ordered with changes.
    fn update<R, F>(&self, f: F) -> R
        where F: FnOnce(&mut GateState) -> R
    {
        let _notify = self.notify.lock();
        let (ret, count, flipped) = {
            let mut st = self.state.lock();
            let before = st.in_flight;
            let ret = f(&mut st);
            let now = st.combined();
            let flipped = if now != st.last {
                st.last = now;
                Some(now)
            } else {
                None
            };
            let count = if st.in_flight != before {
                Some(st.in_flight)
            } else {
                None
            };
            (ret, count, flipped)
        };

        if let Some(n) = count {
            self.in_flight.publish(&n).ok();
        }
        if let Some(b) = flipped {
            debug!("Gate changed to {}", b);
            self.changed.publish(&b).ok();
        }
        ret
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("state", &*self.state.lock())
            .finish()
    }
}
