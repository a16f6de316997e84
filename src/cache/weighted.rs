//! Capacity-weighted LRU map
//!
//! [`WeightedMap`] keeps values in least-recently-used order and tracks the sum of
//! their weights. Whenever an insertion or re-weighing pushes the total over the
//! capacity, least-recently-used values are evicted until it fits again and the
//! eviction listener is called for each, after the map's lock is released.
//!
//! A value's weight is sampled when it is inserted or replaced. Values that grow
//! after insertion (a layer build completing) are re-weighed by replacing them
//! with themselves.

use lru::LruCache;
use parking_lot::Mutex;
use std::sync::Arc;

/// Something with a size in bytes.
pub trait Weighted {
    /// Current weight.
    fn weight(&self) -> u64;
}

/// Called with the key and value of every evicted entry.
pub type EvictionListener<V> = Box<dyn Fn(String, Arc<V>) + Send + Sync>;

struct Slot<V> {
    value: Arc<V>,
    weight: u64,
}

struct Inner<V> {
    lru: LruCache<String, Slot<V>>,
    total: u64,
    capacity: u64,
}

/// LRU map bounded by the total weight of its values.
pub struct WeightedMap<V: Weighted> {
    inner: Mutex<Inner<V>>,
    listener: EvictionListener<V>,
}

impl<V: Weighted> std::fmt::Debug for WeightedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WeightedMap")
            .field("len", &inner.lru.len())
            .field("total", &inner.total)
            .field("capacity", &inner.capacity)
            .finish()
    }
}

impl<V: Weighted> WeightedMap<V> {
    /// Empty map holding at most `capacity` total weight.
    pub fn new(capacity: u64, listener: EvictionListener<V>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::unbounded(),
                total: 0,
                capacity,
            }),
            listener,
        }
    }

    /// Value for `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.inner.lock().lru.get(key).map(|slot| Arc::clone(&slot.value))
    }

    /// Insert `value` unless `key` is present. Returns the present value otherwise.
    ///
    /// Insertion never evicts; the caller re-weighs the value with
    /// [`replace`](Self::replace) once it has accounted for it.
    pub fn put_if_absent(&self, key: &str, value: Arc<V>) -> Result<(), Arc<V>> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.lru.get(key) {
            return Err(Arc::clone(&slot.value));
        }
        let weight = value.weight();
        inner.total += weight;
        inner.lru.put(key.to_string(), Slot { value, weight });
        Ok(())
    }

    /// Replace `expected` with `value` if `key` still maps to `expected`.
    ///
    /// Passing the same value for both re-weighs it. May evict.
    pub fn replace(&self, key: &str, expected: &Arc<V>, value: Arc<V>) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            let Some(slot) = inner.lru.get_mut(key) else {
                return false;
            };
            if !Arc::ptr_eq(&slot.value, expected) {
                return false;
            }
            let old_weight = slot.weight;
            let weight = value.weight();
            slot.value = value;
            slot.weight = weight;
            inner.total = inner.total - old_weight + weight;
            Self::evict_locked(&mut inner)
        };
        self.notify(evicted);
        true
    }

    /// Remove `key` if it maps to `expected`. The listener is not called.
    pub fn remove(&self, key: &str, expected: &Arc<V>) -> bool {
        let mut inner = self.inner.lock();
        match inner.lru.peek(key) {
            Some(slot) if Arc::ptr_eq(&slot.value, expected) => {}
            _ => return false,
        }
        if let Some(slot) = inner.lru.pop(key) {
            inner.total -= slot.weight;
        }
        true
    }

    /// Remove every entry and return them. The listener is not called.
    pub fn drain(&self) -> Vec<(String, Arc<V>)> {
        let mut inner = self.inner.lock();
        inner.total = 0;
        let mut drained = Vec::with_capacity(inner.lru.len());
        while let Some((key, slot)) = inner.lru.pop_lru() {
            drained.push((key, slot.value));
        }
        drained
    }

    /// Entries from most to least recently used, without touching recency.
    pub fn entries(&self) -> Vec<(String, Arc<V>)> {
        self.inner
            .lock()
            .lru
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(&slot.value)))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of recorded weights.
    pub fn total_weight(&self) -> u64 {
        self.inner.lock().total
    }

    /// Weight budget.
    pub fn capacity(&self) -> u64 {
        self.inner.lock().capacity
    }

    /// Change the budget, evicting as needed.
    pub fn set_capacity(&self, capacity: u64) {
        let evicted = {
            let mut inner = self.inner.lock();
            inner.capacity = capacity;
            Self::evict_locked(&mut inner)
        };
        self.notify(evicted);
    }

    fn evict_locked(inner: &mut Inner<V>) -> Vec<(String, Arc<V>)> {
        let mut evicted = Vec::new();
        while inner.total > inner.capacity {
            let Some((key, slot)) = inner.lru.pop_lru() else {
                break;
            };
            inner.total -= slot.weight;
            evicted.push((key, slot.value));
        }
        evicted
    }

    fn notify(&self, evicted: Vec<(String, Arc<V>)>) {
        for (key, value) in evicted {
            (self.listener)(key, value);
        }
    }
}
