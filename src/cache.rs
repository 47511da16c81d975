//! The prepared-template cache: a bounded, count-limited LRU keyed by
//! source identity, with a single-flight barrier so concurrent requests for
//! the same uncached key run the preparation closure exactly once.

use crate::error::SharedError;
use parking_lot::{Condvar, Mutex};
use schnellru::{ByLength, LruMap};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

/// Identifies a preparable source: its logical name plus a content
/// fingerprint, so that re-registering a fragment or template under the
/// same name with different bytes misses the cache instead of serving a
/// stale entry.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    pub source_id: String,
    pub fingerprint: u64,
}

impl CacheKey {
    /// Builds a key from a source identifier and its raw bytes, hashing the
    /// bytes with the standard library's default hasher. Not
    /// cryptographic; only collision-avoidance for cache correctness is
    /// required here.
    pub fn new(source_id: impl Into<String>, bytes: &[u8]) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        bytes.hash(&mut hasher);
        Self {
            source_id: source_id.into(),
            fingerprint: hasher.finish(),
        }
    }
}

/// The shared outcome of an in-progress preparation: followers wait on
/// `done`/`cvar` until the leader publishes `result`.
struct InFlight<T> {
    done: Mutex<bool>,
    cvar: Condvar,
    result: OnceLock<Result<Arc<T>, SharedError>>,
}

/// A bounded cache of prepared values, with single-flight coalescing of
/// concurrent misses on the same key. `capacity == 0` disables caching:
/// every call to [`TemplateCache::get_or_prepare`] invokes `prepare`
/// directly, bypassing both the hit-cache and the in-flight table.
pub struct TemplateCache<T> {
    capacity: u32,
    hits: Mutex<LruMap<CacheKey, Arc<T>, ByLength>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<InFlight<T>>>>,
}

impl<T> TemplateCache<T> {
    /// Creates a cache holding at most `capacity` prepared values. A
    /// capacity of 0 disables caching entirely.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            hits: Mutex::new(LruMap::new(ByLength::new(capacity.max(1)))),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of currently cached entries (0 if caching is
    /// disabled).
    pub fn len(&self) -> usize {
        if self.capacity == 0 {
            0
        } else {
            self.hits.lock().len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every cached entry and aborts no in-flight preparation (a
    /// leader already running will still populate the hit cache with its
    /// result, which is fine: a clear is a point-in-time eviction, not a
    /// promise that nothing is added afterward).
    pub fn clear(&self) {
        self.hits.lock().clear();
    }

    /// Returns the cached value for `key`, preparing it via `prepare` on a
    /// miss. Concurrent callers that miss on the same key block on the
    /// first caller's `prepare` call rather than each running their own;
    /// if `prepare` panics, every waiter (and the leader itself, via the
    /// unwind) surfaces [`crate::error::Error::Internal`] rather than
    /// hanging or re-panicking.
    pub fn get_or_prepare(
        &self,
        key: CacheKey,
        prepare: impl FnOnce() -> Result<T, SharedError>,
    ) -> Result<Arc<T>, SharedError> {
        if self.capacity == 0 {
            return prepare().map(Arc::new);
        }

        if let Some(hit) = self.hits.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }

        // The in-flight table's own lock is the serialization point that
        // decides leadership: whoever's insert call observes no existing
        // entry is the leader, and every later arrival for the same key
        // sees that entry already present. There is no window where two
        // callers both believe they are the leader.
        enum Role<T> {
            Leader(Arc<InFlight<T>>),
            Follower(Arc<InFlight<T>>),
        }
        let role = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                Role::Follower(Arc::clone(existing))
            } else {
                let flight = Arc::new(InFlight {
                    done: Mutex::new(false),
                    cvar: Condvar::new(),
                    result: OnceLock::new(),
                });
                in_flight.insert(key.clone(), Arc::clone(&flight));
                Role::Leader(flight)
            }
        };

        match role {
            Role::Follower(flight) => {
                let mut done = flight.done.lock();
                while !*done {
                    flight.cvar.wait(&mut done);
                }
                match flight.result.get() {
                    Some(result) => result.clone(),
                    None => Err(Arc::new(crate::error::Error::Internal(
                        "template preparation panicked before publishing a result".to_string(),
                    ))),
                }
            }
            Role::Leader(flight) => {
                // Ensure the in-flight entry is removed, and waiters are
                // woken, on every exit path, including a panic unwinding
                // out of `prepare`.
                let key_for_cleanup = key.clone();
                let in_flight_table = &self.in_flight;
                let flight_for_cleanup = Arc::clone(&flight);
                let _cleanup = scopeguard::guard((), move |()| {
                    in_flight_table.lock().remove(&key_for_cleanup);
                    *flight_for_cleanup.done.lock() = true;
                    flight_for_cleanup.cvar.notify_all();
                });

                let outcome = prepare().map(Arc::new);
                let _ = flight.result.set(outcome.clone());
                if let Ok(value) = &outcome {
                    self.hits.lock().insert(key, Arc::clone(value));
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn caches_successful_preparation() {
        let cache: TemplateCache<String> = TemplateCache::new(4);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("t", b"hello");
        for _ in 0..3 {
            let result = cache.get_or_prepare(key.clone(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("prepared".to_string())
            });
            assert_eq!(*result.unwrap(), "prepared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_fingerprints_miss_independently() {
        let cache: TemplateCache<String> = TemplateCache::new(4);
        let a = cache
            .get_or_prepare(CacheKey::new("t", b"a"), || Ok("a".to_string()))
            .unwrap();
        let b = cache
            .get_or_prepare(CacheKey::new("t", b"b"), || Ok("b".to_string()))
            .unwrap();
        assert_ne!(*a, *b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache: TemplateCache<String> = TemplateCache::new(0);
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("t", b"hello");
        for _ in 0..3 {
            cache
                .get_or_prepare(key.clone(), || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("prepared".to_string())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn preparation_errors_are_not_cached_as_hits() {
        let cache: TemplateCache<String> = TemplateCache::new(4);
        let key = CacheKey::new("t", b"hello");
        let first = cache.get_or_prepare(key.clone(), || {
            Err::<String, _>(Arc::new(crate::error::Error::Internal("boom".to_string())))
        });
        assert!(first.is_err());
        assert_eq!(cache.len(), 0);
        let second = cache.get_or_prepare(key, || Ok("ok".to_string()));
        assert_eq!(*second.unwrap(), "ok");
    }

    #[test]
    fn concurrent_misses_on_the_same_key_run_prepare_once() {
        use std::sync::Barrier;
        use std::thread;

        let cache: Arc<TemplateCache<String>> = Arc::new(TemplateCache::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let key = CacheKey::new("t", b"hello");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                let key = key.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_prepare(key, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok("prepared".to_string())
                        })
                        .unwrap()
                })
            })
            .collect();

        for h in handles {
            assert_eq!(*h.join().unwrap(), "prepared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
