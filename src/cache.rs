use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam_channel as cbch;
use parking_lot::Mutex;
use tao_log::{debug, trace};

use crate::{Canceled, Failure};

/// A callback receiving the outcome for a requested key.
pub type Waiter<V> = Box<dyn FnOnce(Result<V, Failure>) + Send + 'static>;

type ReleaseFn<V> = Box<dyn Fn(V) + Send + Sync + 'static>;

/// A bounded, memoizing key to value cache, which deduplicates concurrent
/// computations of the same key.
///
/// Each key is computed at most once while its value remains cached:
/// requests for a key whose computation is still pending are attached to
/// that computation, and receive its outcome when it resolves. Failed
/// computations are delivered to every attached waiter and are _not_ cached,
/// so the next request retries.
///
/// When the number of entries exceeds capacity, the least recently accessed
/// _ready_ entries are evicted and passed to the release callback, if
/// any. Pending entries are never evicted, since that would strand their
/// waiters. The cache may therefore temporarily exceed its capacity while
/// computations are outstanding.
pub struct MemoizingCache<K, V> {
    capacity: usize,
    table: Mutex<Table<K, V>>,
    on_release: Option<ReleaseFn<V>>,
}

struct Table<K, V> {
    entries: HashMap<K, Entry<V>>,
    tick: u64,
}

struct Entry<V> {
    slot: Slot<V>,
    last_access: u64,
}

enum Slot<V> {
    Pending(Vec<Waiter<V>>),
    Ready(V),
}

enum Lookup<V> {
    Hit(V, Waiter<V>),
    Attached,
    Miss(Vec<V>),
}

impl<V> Slot<V> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending(_))
    }
}

impl<K, V> Table<K, V>
    where K: Eq + Hash + Clone
{
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    // Evict least recently accessed ready entries until within capacity, or
    // only pending entries remain.
    fn trim(&mut self, capacity: usize) -> Vec<V> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let oldest = self.entries.iter()
                .filter(|(_, e)| !e.slot.is_pending())
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            let key = match oldest {
                Some(k) => k,
                None => {
                    trace!("MemoizingCache: over capacity with only \
                            pending entries ({})", self.entries.len());
                    break;
                }
            };
            if let Some(Entry { slot: Slot::Ready(v), .. }) = self.entries.remove(&key) {
                evicted.push(v);
            }
        }
        evicted
    }
}

impl<K, V> MemoizingCache<K, V>
    where K: Eq + Hash + Clone + Send + 'static,
          V: Clone + Send + 'static
{
    /// Create a new cache of the given capacity.
    pub fn new(capacity: usize) -> MemoizingCache<K, V> {
        MemoizingCache {
            capacity,
            table: Mutex::new(Table { entries: HashMap::new(), tick: 0 }),
            on_release: None,
        }
    }

    /// Create a new cache of the given capacity, with a callback for values
    /// that are evicted or invalidated.
    ///
    /// The callback is called exactly once per removed value, after its
    /// removal, and without any internal lock held.
    pub fn with_release<F>(capacity: usize, on_release: F) -> MemoizingCache<K, V>
        where F: Fn(V) + Send + Sync + 'static
    {
        MemoizingCache {
            on_release: Some(Box::new(on_release)),
            ..MemoizingCache::new(capacity)
        }
    }

    /// Return the configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the number of entries, ready or pending.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// Return true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver the value for key to waiter, computing it via compute only if
    /// neither cached nor already pending.
    ///
    /// A cached value is delivered immediately, on the calling thread. A
    /// pending value is delivered on whichever thread completes its
    /// computation. Otherwise compute is run here (with panics caught as
    /// failures) and its outcome delivered to waiter and any others that
    /// attached in the meantime. This never blocks on other computations.
    pub fn fetch<F>(&self, key: K, waiter: Waiter<V>, compute: F)
        where F: FnOnce() -> Result<V, Failure>
    {
        let lookup = {
            let mut table = self.table.lock();
            let now = table.touch();
            match table.entries.get_mut(&key) {
                Some(entry) => match entry.slot {
                    Slot::Ready(ref v) => {
                        entry.last_access = now;
                        Lookup::Hit(v.clone(), waiter)
                    }
                    Slot::Pending(ref mut waiters) => {
                        waiters.push(waiter);
                        trace!("MemoizingCache: attached to pending, \
                                {} waiters", waiters.len());
                        Lookup::Attached
                    }
                },
                None => {
                    table.entries.insert(key.clone(), Entry {
                        slot: Slot::Pending(vec![waiter]),
                        last_access: now,
                    });
                    Lookup::Miss(table.trim(self.capacity))
                }
            }
        };

        match lookup {
            Lookup::Hit(v, waiter) => {
                trace!("MemoizingCache: hit");
                waiter(Ok(v));
                return;
            }
            Lookup::Attached => return,
            Lookup::Miss(evicted) => self.release(evicted),
        }

        trace!("MemoizingCache: miss, computing");
        let outcome = match catch_unwind(AssertUnwindSafe(compute)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(Failure::from_panic(payload)),
        };
        self.resolve(key, outcome);
    }

    /// Return the value for key, computing it via compute if neither cached
    /// nor already pending.
    ///
    /// If another caller is computing the same key, this blocks until that
    /// computation resolves. A compute closure must not itself request its
    /// own key, or it will wait on itself.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> Result<V, Failure>
        where F: FnOnce() -> Result<V, Failure>
    {
        let (tx, rx) = cbch::bounded(1);
        self.fetch(key, Box::new(move |outcome| {
            tx.send(outcome).ok();
        }), compute);
        match rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(Failure::from(Canceled)),
        }
    }

    /// Return the cached value for key, if ready, refreshing its recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut table = self.table.lock();
        let now = table.touch();
        match table.entries.get_mut(key) {
            Some(Entry { slot: Slot::Ready(v), last_access }) => {
                *last_access = now;
                Some(v.clone())
            }
            _ => None,
        }
    }

    /// Return true if key has an entry, ready or pending.
    pub fn contains(&self, key: &K) -> bool {
        self.table.lock().entries.contains_key(key)
    }

    /// Return true if key has a pending computation.
    pub fn is_pending(&self, key: &K) -> bool {
        self.table.lock().entries.get(key)
            .map(|e| e.slot.is_pending())
            .unwrap_or(false)
    }

    /// Remove the ready value for key, passing it to the release callback.
    ///
    /// A pending entry is not removed. Returns true if a value was removed.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = {
            let mut table = self.table.lock();
            let pending = table.entries.get(key).map(|e| e.slot.is_pending());
            match pending {
                Some(false) => table.entries.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(Entry { slot: Slot::Ready(v), .. }) => {
                self.release(vec![v]);
                true
            }
            _ => false,
        }
    }

    /// Remove all ready values, passing each to the release callback.
    /// Pending entries are retained.
    pub fn invalidate_all(&self) {
        let removed = {
            let mut table = self.table.lock();
            let keys: Vec<K> = table.entries.iter()
                .filter(|(_, e)| !e.slot.is_pending())
                .map(|(k, _)| k.clone())
                .collect();
            let mut removed = Vec::with_capacity(keys.len());
            for k in keys {
                if let Some(Entry { slot: Slot::Ready(v), .. }) = table.entries.remove(&k) {
                    removed.push(v);
                }
            }
            removed
        };
        self.release(removed);
    }

    /// Return clones of all ready values, in no particular order.
    pub fn cached_values(&self) -> Vec<V> {
        self.table.lock().entries.values()
            .filter_map(|e| match e.slot {
                Slot::Ready(ref v) => Some(v.clone()),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    // Transition a pending entry to ready (or remove it on failure), then
    // deliver to its waiters and release anything evicted, all outside the
    // lock.
    fn resolve(&self, key: K, outcome: Result<V, Failure>) {
        let (waiters, evicted) = {
            let mut table = self.table.lock();
            let now = table.touch();
            let waiters = match outcome {
                Ok(ref v) => match table.entries.get_mut(&key) {
                    Some(entry) => {
                        entry.last_access = now;
                        match std::mem::replace(&mut entry.slot, Slot::Ready(v.clone())) {
                            Slot::Pending(waiters) => waiters,
                            Slot::Ready(_) => Vec::new(),
                        }
                    }
                    None => Vec::new(),
                },
                Err(_) => match table.entries.remove(&key) {
                    Some(Entry { slot: Slot::Pending(waiters), .. }) => waiters,
                    _ => Vec::new(),
                },
            };
            (waiters, table.trim(self.capacity))
        };

        trace!("MemoizingCache: resolved for {} waiters", waiters.len());
        for waiter in waiters {
            waiter(outcome.clone());
        }
        self.release(evicted);
    }

    fn release(&self, values: Vec<V>) {
        if values.is_empty() {
            return;
        }
        debug!("MemoizingCache: releasing {} values", values.len());
        if let Some(ref on_release) = self.on_release {
            for v in values {
                on_release(v);
            }
        }
    }
}

impl<K, V> fmt::Debug for MemoizingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock();
        let pending = table.entries.values()
            .filter(|e| matches!(e.slot, Slot::Pending(_)))
            .count();
        f.debug_struct("MemoizingCache")
            .field("capacity", &self.capacity)
            .field("entries", &table.entries.len())
            .field("pending", &pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn log_init() {
        piccolog::test_logger();
    }

    fn sink<V: Send + 'static>() -> (Arc<Mutex<Vec<Result<V, Failure>>>>, impl Fn() -> Waiter<V>) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o2 = out.clone();
        (out, move || -> Waiter<V> {
            let o = o2.clone();
            Box::new(move |r| o.lock().push(r))
        })
    }

    fn ignore<V: Send + 'static>() -> Waiter<V> {
        Box::new(|_: Result<V, Failure>| {})
    }

    fn released() -> (Arc<Mutex<Vec<i32>>>, impl Fn(i32) + Send + Sync + 'static) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o2 = out.clone();
        (out, move |v| o2.lock().push(v))
    }

    #[test]
    fn attach_to_pending() {
        log_init();
        let cache = Arc::new(MemoizingCache::<i32, i32>::new(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let (out, waiter) = sink();

        let c2 = cache.clone();
        let calls2 = calls.clone();
        let inner_waiter = waiter();
        cache.fetch(1, waiter(), move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            assert!(c2.is_pending(&1));
            // Attaches to this pending computation, does not compute.
            c2.fetch(1, inner_waiter, || panic!("computed twice"));
            Ok(5)
        });

        assert_eq!(1, calls.load(Ordering::SeqCst));
        let out: Vec<i32> = out.lock().iter().map(|r| *r.as_ref().unwrap()).collect();
        assert_eq!(vec![5, 5], out);
        assert_eq!(Some(5), cache.get(&1));
    }

    #[test]
    fn ready_hit_skips_compute() {
        log_init();
        let cache = MemoizingCache::<&str, usize>::new(2);
        assert_eq!(3, cache.get_or_compute("abc", || Ok(3)).unwrap());
        assert_eq!(3, cache.get_or_compute("abc", || panic!("not cached")).unwrap());
        assert_eq!(1, cache.len());
    }

    #[test]
    fn evicts_least_recently_accessed() {
        log_init();
        let (rel, on_release) = released();
        let cache = MemoizingCache::with_release(2, on_release);
        cache.get_or_compute(1, || Ok(10)).unwrap();
        cache.get_or_compute(2, || Ok(20)).unwrap();
        // Touch 1, so 2 becomes least recent.
        assert_eq!(Some(10), cache.get(&1));
        cache.get_or_compute(3, || Ok(30)).unwrap();

        assert_eq!(vec![20], *rel.lock());
        assert_eq!(2, cache.len());
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        let mut vals = cache.cached_values();
        vals.sort();
        assert_eq!(vec![10, 30], vals);
    }

    #[test]
    fn pending_never_evicted() {
        log_init();
        let (rel, on_release) = released();
        let cache = Arc::new(MemoizingCache::with_release(1, on_release));
        let (out, waiter) = sink();

        let c2 = cache.clone();
        let rel2 = rel.clone();
        cache.fetch(1, waiter(), move || {
            // Over capacity, but only 1 (pending) may be evicted: nothing is.
            c2.fetch(2, ignore(), || Ok(20));
            c2.fetch(3, ignore(), || Ok(30));
            assert!(c2.is_pending(&1));
            assert!(c2.len() >= 1);
            assert_eq!(vec![20, 30], *rel2.lock());
            Ok(10)
        });

        assert_eq!(1, out.lock().len());
        assert_eq!(10, *out.lock()[0].as_ref().unwrap());
        assert_eq!(1, cache.len());
        assert_eq!(Some(10), cache.get(&1));
        assert_eq!(vec![20, 30], *rel.lock());
    }

    #[test]
    fn over_capacity_trims_after_resolve() {
        log_init();
        let (rel, on_release) = released();
        let cache = Arc::new(MemoizingCache::with_release(1, on_release));
        let c2 = cache.clone();
        cache.fetch(1, ignore(), move || {
            let c3 = c2.clone();
            c2.fetch(2, ignore(), move || {
                assert_eq!(2, c3.len());
                Ok(20)
            });
            Ok(10)
        });
        // 2 resolved first while 1 pending; it was the only ready candidate.
        assert_eq!(vec![20], *rel.lock());
        assert_eq!(1, cache.len());
    }

    #[test]
    fn failure_delivered_and_retried() {
        log_init();
        let cache = Arc::new(MemoizingCache::<u8, u8>::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let (out, waiter) = sink();

        let c2 = cache.clone();
        let joined = waiter();
        let calls2 = calls.clone();
        cache.fetch(7, waiter(), move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            c2.fetch(7, joined, || Ok(0));
            Err(Failure::new("transient"))
        });
        {
            let out = out.lock();
            assert_eq!(2, out.len());
            assert!(out.iter().all(|r| r.as_ref().unwrap_err().to_string() == "transient"));
        }
        assert!(!cache.contains(&7));

        let calls3 = calls.clone();
        let v = cache.get_or_compute(7, move || {
            calls3.fetch_add(1, Ordering::SeqCst);
            Ok(49)
        });
        assert_eq!(49, v.unwrap());
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }

    #[test]
    fn compute_panic_is_failure() {
        log_init();
        let cache = MemoizingCache::<u8, u8>::new(4);
        let err = cache.get_or_compute(1, || panic!("compute panics")).unwrap_err();
        assert!(err.is_panic());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_releases_ready_only() {
        log_init();
        let (rel, on_release) = released();
        let cache = Arc::new(MemoizingCache::with_release(8, on_release));
        cache.get_or_compute(1, || Ok(1)).unwrap();
        cache.get_or_compute(2, || Ok(2)).unwrap();
        assert!(cache.invalidate(&1));
        assert!(!cache.invalidate(&1));
        assert_eq!(vec![1], *rel.lock());

        let c2 = cache.clone();
        cache.fetch(3, ignore(), move || {
            assert!(!c2.invalidate(&3));
            c2.invalidate_all();
            assert!(c2.contains(&3));
            Ok(3)
        });
        assert_eq!(vec![1, 2], *rel.lock());
        assert_eq!(Some(3), cache.get(&3));
    }

    #[test]
    fn concurrent_threads_compute_once() {
        log_init();
        let cache = Arc::new(MemoizingCache::<u32, u32>::new(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8).map(|i| {
            let cache = cache.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let key = i % 2;
                barrier.wait();
                cache.get_or_compute(key, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    Ok(key * 5)
                })
            })
        }).collect();

        for (i, h) in handles.into_iter().enumerate() {
            let v = h.join().unwrap().unwrap();
            assert_eq!((i as u32 % 2) * 5, v);
        }
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }
}
