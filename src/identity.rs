use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

/// Bounded name→id memo for channel and user identities. Strict LRU: a hit
/// refreshes recency, overflow evicts the least recently used name. Misses
/// are never an error; the caller falls through to the repo's GetOrCreate.
pub struct IdentityCache {
    inner: Mutex<LruInner>,
}

struct LruInner {
    capacity: usize,
    clock: u64,
    entries: HashMap<String, CacheEntry>,
    // Recency queue with lazy invalidation: each touch pushes a fresh
    // (name, stamp) pair and the old pair becomes stale.
    order: VecDeque<(String, u64)>,
}

struct CacheEntry {
    id: i64,
    stamp: u64,
}

impl IdentityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                capacity,
                clock: 0,
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        let mut inner = self.inner.lock().expect("identity cache lock");
        inner.clock += 1;
        let stamp = inner.clock;
        let id = {
            let entry = inner.entries.get_mut(name)?;
            entry.stamp = stamp;
            entry.id
        };
        inner.order.push_back((name.to_owned(), stamp));
        inner.sweep_stale();
        Some(id)
    }

    pub fn put(&self, name: &str, id: i64) {
        let mut inner = self.inner.lock().expect("identity cache lock");
        if inner.capacity == 0 {
            return;
        }

        inner.clock += 1;
        let stamp = inner.clock;
        inner
            .entries
            .insert(name.to_owned(), CacheEntry { id, stamp });
        inner.order.push_back((name.to_owned(), stamp));

        while inner.entries.len() > inner.capacity {
            let Some((candidate, candidate_stamp)) = inner.order.pop_front() else {
                break;
            };
            let live = inner
                .entries
                .get(&candidate)
                .is_some_and(|entry| entry.stamp == candidate_stamp);
            if live {
                inner.entries.remove(&candidate);
            }
        }
        inner.sweep_stale();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("identity cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LruInner {
    fn sweep_stale(&mut self) {
        while let Some((name, stamp)) = self.order.front() {
            let live = self
                .entries
                .get(name)
                .is_some_and(|entry| entry.stamp == *stamp);
            if live {
                break;
            }
            self.order.pop_front();
        }
    }
}
