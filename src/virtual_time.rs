use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tao_log::trace;

use crate::scheduler::{Scheduler, Work};

/// A [`Scheduler`] driven by a virtual clock, for deterministic tests.
///
/// Nothing runs until the clock is explicitly advanced, at which point due
/// work is run on the advancing thread, in order of due time and then of
/// submission. Work scheduled while advancing is eligible in the same
/// advance, if due.
pub struct VirtualScheduler {
    state: Mutex<Clock>,
}

struct Clock {
    origin: Instant,
    elapsed: Duration,
    next_seq: u64,
    queue: BinaryHeap<Reverse<Timed>>,
}

struct Timed {
    due: Duration,
    seq: u64,
    work: Work,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Timed) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Timed) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    fn cmp(&self, other: &Timed) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl VirtualScheduler {
    /// Create a new scheduler with its clock at zero elapsed.
    pub fn new() -> VirtualScheduler {
        VirtualScheduler {
            state: Mutex::new(Clock {
                origin: Instant::now(),
                elapsed: Duration::from_secs(0),
                next_seq: 0,
                queue: BinaryHeap::new(),
            })
        }
    }

    /// Return the virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Return the number of scheduled units of work not yet run.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Run all work that is currently due, without advancing the clock.
    ///
    /// Returns the number of units run.
    pub fn run_ready(&self) -> usize {
        self.advance_by(Duration::from_secs(0))
    }

    /// Advance the clock by `delta`, running work as it comes due.
    ///
    /// Returns the number of units run.
    pub fn advance_by(&self, delta: Duration) -> usize {
        let target = self.elapsed() + delta;
        self.advance_to(target)
    }

    /// Advance the clock to `target` elapsed time, running work as it comes
    /// due. The clock never moves backward.
    ///
    /// Returns the number of units run.
    pub fn advance_to(&self, target: Duration) -> usize {
        let mut ran = 0;
        while let Some(work) = self.pop_due(Some(target)) {
            work();
            ran += 1;
        }
        let mut clock = self.state.lock();
        if clock.elapsed < target {
            clock.elapsed = target;
        }
        trace!("VirtualScheduler advanced to {:?}, ran {}", clock.elapsed, ran);
        ran
    }

    /// Run all scheduled work, including delayed work, advancing the clock
    /// as needed, until the queue is empty.
    ///
    /// Returns the number of units run.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        while let Some(work) = self.pop_due(None) {
            work();
            ran += 1;
        }
        ran
    }

    // Pop the next unit due by limit (or any, if None), moving the clock to
    // its due time. The lock is released before the unit is run.
    fn pop_due(&self, limit: Option<Duration>) -> Option<Work> {
        let mut clock = self.state.lock();
        let due = match clock.queue.peek() {
            Some(Reverse(next)) => next.due,
            None => return None,
        };
        if let Some(limit) = limit {
            if due > limit {
                return None;
            }
        }
        let Reverse(next) = clock.queue.pop()?;
        if clock.elapsed < next.due {
            clock.elapsed = next.due;
        }
        Some(next.work)
    }

    fn push(&self, delay: Duration, work: Work) {
        let mut clock = self.state.lock();
        let due = clock.elapsed + delay;
        let seq = clock.next_seq;
        clock.next_seq += 1;
        clock.queue.push(Reverse(Timed { due, seq, work }));
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule(&self, work: Work) {
        self.push(Duration::from_secs(0), work);
    }

    fn schedule_after(&self, delay: Duration, work: Work) {
        self.push(delay, work);
    }

    fn now(&self) -> Instant {
        let clock = self.state.lock();
        clock.origin + clock.elapsed
    }
}

impl Default for VirtualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VirtualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = self.state.lock();
        f.debug_struct("VirtualScheduler")
            .field("elapsed", &clock.elapsed)
            .field("pending", &clock.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Work) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l2 = log.clone();
        let mk = move |name: &'static str| -> Work {
            let l = l2.clone();
            Box::new(move || l.lock().push(name))
        };
        (log, mk)
    }

    #[test]
    fn nothing_runs_until_advanced() {
        let vs = VirtualScheduler::new();
        let (log, mk) = recorder();
        vs.schedule(mk("a"));
        assert_eq!(1, vs.pending());
        assert!(log.lock().is_empty());
        assert_eq!(1, vs.run_ready());
        assert_eq!(vec!["a"], *log.lock());
    }

    #[test]
    fn delayed_work_in_due_order() {
        let vs = VirtualScheduler::new();
        let (log, mk) = recorder();
        vs.schedule_after(Duration::from_millis(30), mk("c"));
        vs.schedule_after(Duration::from_millis(10), mk("a"));
        vs.schedule_after(Duration::from_millis(10), mk("b"));

        assert_eq!(0, vs.advance_by(Duration::from_millis(5)));
        assert_eq!(2, vs.advance_by(Duration::from_millis(10)));
        assert_eq!(vec!["a", "b"], *log.lock());
        assert_eq!(Duration::from_millis(15), vs.elapsed());

        assert_eq!(1, vs.run());
        assert_eq!(vec!["a", "b", "c"], *log.lock());
        assert_eq!(Duration::from_millis(30), vs.elapsed());
    }

    #[test]
    fn now_tracks_virtual_time() {
        let vs = VirtualScheduler::new();
        let start = vs.now();
        vs.advance_by(Duration::from_secs(3600));
        assert_eq!(Duration::from_secs(3600), vs.now() - start);
    }

    #[test]
    fn work_scheduled_while_running() {
        let vs = Arc::new(VirtualScheduler::new());
        let (log, mk) = recorder();
        let inner = mk("inner");
        let vs2 = vs.clone();
        let outer = mk("outer");
        vs.schedule(Box::new(move || {
            outer();
            vs2.schedule_after(Duration::from_millis(1), inner);
        }));
        assert_eq!(1, vs.run_ready());
        assert_eq!(1, vs.advance_by(Duration::from_millis(1)));
        assert_eq!(vec!["outer", "inner"], *log.lock());
    }
}
