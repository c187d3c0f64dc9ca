/// A size limited LRU (least recently used) cache with single flight loading.
///
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};

use futures::{
    channel::oneshot,
    future::{BoxFuture, FutureExt, Shared},
};
use parking_lot::Mutex;

use crate::errors::{Error, Result};

/// A trait for objects that can be cached
///
/// Cacheable objects must be able to self report their size via the ``size`` method.
///
pub trait Cacheable: Sized {
    /// Return the approximate number of bytes used by this object
    fn size(&self) -> u64;
}

type LoadResult<V> = std::result::Result<Arc<V>, String>;
type PendingLoad<V> = Shared<oneshot::Receiver<LoadResult<V>>>;

/// An LRU (least recently used) cache.
///
/// Values must implement ``Cacheable``, which self reports size, intended to be the number of
/// bytes (more or less) an object takes up in memory. Per file inventories report the size of
/// their persisted record, which is close enough.
///
/// When an object added to the cache pushes the total size over ``limit``, least recently used
/// objects are evicted until the total is back under the limit. An object larger than the limit
/// is handed back to the caller but not kept.
///
/// When ``get`` misses, the ``load`` function passed in is used to load the object. Concurrent
/// requests for an object that is already being loaded wait for that load instead of starting
/// their own.
///
/// Keys must identify immutable values. Inventories are keyed by file location and
/// modification time, so a rewritten file gets a new key and the stale entry simply ages out.
///
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    entries: Mutex<Entries<K, V>>,

    /// Loads in progress
    pending: Mutex<HashMap<K, PendingLoad<V>>>,
}

/// What a cache miss has to do: wait on someone else's load or run its own
enum Lookup<V> {
    Wait(PendingLoad<V>),
    Load(oneshot::Sender<LoadResult<V>>),
}

/// Removes a key from the pending loads when dropped, finished or not
struct PendingGuard<'a, K, V>
where
    K: Eq + Hash,
{
    pending: &'a Mutex<HashMap<K, PendingLoad<V>>>,
    key: &'a K,
}

impl<K, V> Drop for PendingGuard<'_, K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        self.pending.lock().remove(self.key);
    }
}

struct Entries<K, V> {
    limit: u64,

    /// Sum of sizes of all entries
    size: u64,

    /// Incremented on every use of an entry
    tick: u64,

    map: HashMap<K, Entry<V>>,

    /// Keys by the tick of their last use, least recent first
    by_use: BTreeMap<u64, K>,
}

struct Entry<V> {
    object: Arc<V>,
    size: u64,
    used: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Cacheable,
{
    /// Instantiate an empty cache with given size limit.
    ///
    pub fn new(limit: u64) -> Self {
        Self {
            entries: Mutex::new(Entries {
                limit,
                size: 0,
                tick: 0,
                map: HashMap::new(),
                by_use: BTreeMap::new(),
            }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Get an object by key, calling ``load`` to load it on a cache miss.
    ///
    /// ``load`` returning ``Ok(None)`` is reported as ``Error::NotFound``. Failed loads are not
    /// cached. The task that ran a load gets its error as is, tasks that waited on it get
    /// ``Error::Load``. If the task running a load is dropped before it finishes, waiting tasks
    /// start over and one of them runs its own load.
    ///
    pub async fn get<L>(&self, key: &K, load: L) -> Result<Arc<V>>
    where
        L: FnOnce(K) -> BoxFuture<'static, Result<Option<V>>>,
    {
        loop {
            let lookup = {
                let mut pending = self.pending.lock();
                if let Some(object) = self.entries.lock().touch(key) {
                    return Ok(object);
                }
                match pending.get(key) {
                    Some(waiting) => Lookup::Wait(waiting.clone()),
                    None => {
                        let (notify, waiting) = oneshot::channel();
                        pending.insert(key.clone(), waiting.shared());

                        Lookup::Load(notify)
                    }
                }
            };

            match lookup {
                Lookup::Load(notify) => return self.run_load(key, load, notify).await,
                Lookup::Wait(waiting) => match waiting.await {
                    Ok(Ok(object)) => return Ok(object),
                    Ok(Err(err)) => return Err(Error::Load(err)),
                    Err(oneshot::Canceled) => continue,
                },
            }
        }
    }

    async fn run_load<L>(
        &self,
        key: &K,
        load: L,
        notify: oneshot::Sender<LoadResult<V>>,
    ) -> Result<Arc<V>>
    where
        L: FnOnce(K) -> BoxFuture<'static, Result<Option<V>>>,
    {
        // Declared after `notify`, so waiters never wake to a stale pending entry
        let guard = PendingGuard {
            pending: &self.pending,
            key,
        };

        let result = match load(key.clone()).await {
            Ok(Some(object)) => Ok(Arc::new(object)),
            Ok(None) => Err(Error::NotFound(format!("{key:?}"))),
            Err(err) => Err(err),
        };

        if let Ok(object) = &result {
            self.entries.lock().insert(key.clone(), object);
        }
        drop(guard);

        // Nobody waiting is fine
        let _ = notify.send(match &result {
            Ok(object) => Ok(Arc::clone(object)),
            Err(err) => Err(err.to_string()),
        });

        result
    }

    /// Number of objects currently cached
    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Entries<K, V>
where
    K: Eq + Hash + Clone,
    V: Cacheable,
{
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up an object, marking it most recently used.
    ///
    fn touch(&mut self, key: &K) -> Option<Arc<V>> {
        let tick = self.next_tick();
        let entry = self.map.get_mut(key)?;
        self.by_use.remove(&entry.used);
        self.by_use.insert(tick, key.clone());
        entry.used = tick;

        Some(Arc::clone(&entry.object))
    }

    fn insert(&mut self, key: K, object: &Arc<V>) {
        let used = self.next_tick();
        let size = object.size();
        let entry = Entry {
            object: Arc::clone(object),
            size,
            used,
        };
        if let Some(replaced) = self.map.insert(key.clone(), entry) {
            self.by_use.remove(&replaced.used);
            self.size -= replaced.size;
        }
        self.by_use.insert(used, key);
        self.size += size;

        while self.size > self.limit {
            let evicted = match self.by_use.pop_first() {
                Some((_, key)) => self.map.remove(&key),
                None => break,
            };
            if let Some(evicted) = evicted {
                self.size -= evicted.size;
            }
        }
    }

    /// Keys from most to least recently used
    #[cfg(test)]
    fn recency(&self) -> Vec<K> {
        self.by_use.values().rev().cloned().collect()
    }
}
