use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use domain::AuthorProfile;
use indexmap::IndexMap;

pub const DEFAULT_AUTHOR_CAPACITY: usize = 4_096;
pub const DEFAULT_LIKED_CAPACITY: usize = 16_384;

/// Least-recently-used map with a fixed capacity.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    entries: IndexMap<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Looks up and marks the entry as recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let (k, v) = self.entries.shift_remove_entry(key)?;
        self.entries.insert(k, v);
        self.entries.last().map(|(_, v)| v)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.entries.shift_remove(&key);
        if self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Process-wide author profiles, shared by every open session.
#[derive(Clone)]
pub struct AuthorCache {
    inner: Arc<Mutex<BoundedCache<String, AuthorProfile>>>,
}

impl AuthorCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoundedCache::new(capacity))),
        }
    }

    pub fn get(&self, user_id: &str) -> Option<AuthorProfile> {
        lock(&self.inner).get(&user_id.to_string()).cloned()
    }

    /// Ids from `user_ids` with no cached profile, deduplicated.
    pub fn missing(&self, user_ids: &[String]) -> Vec<String> {
        let cache = lock(&self.inner);
        let mut out: Vec<String> = Vec::new();
        for id in user_ids {
            if !cache.contains_key(id) && !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }

    /// Newer data wins.
    pub fn merge(&self, profiles: impl IntoIterator<Item = AuthorProfile>) {
        let mut cache = lock(&self.inner);
        for profile in profiles {
            cache.insert(profile.user_id.clone(), profile);
        }
    }

    pub fn lookup<'a>(&self, user_ids: impl IntoIterator<Item = &'a String>) -> HashMap<String, AuthorProfile> {
        let mut cache = lock(&self.inner);
        user_ids
            .into_iter()
            .filter_map(|id| cache.get(id).map(|p| (id.clone(), p.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

impl Default for AuthorCache {
    fn default() -> Self {
        Self::new(DEFAULT_AUTHOR_CAPACITY)
    }
}

/// Process-wide liked flags keyed by `(viewer, comment)`.
#[derive(Clone)]
pub struct LikedCache {
    inner: Arc<Mutex<BoundedCache<(String, String), bool>>>,
}

impl LikedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoundedCache::new(capacity))),
        }
    }

    pub fn get(&self, viewer_id: &str, comment_id: &str) -> bool {
        lock(&self.inner)
            .get(&(viewer_id.to_string(), comment_id.to_string()))
            .copied()
            .unwrap_or(false)
    }

    pub fn set(&self, viewer_id: &str, comment_id: &str, liked: bool) {
        lock(&self.inner).insert((viewer_id.to_string(), comment_id.to_string()), liked);
    }

    pub fn extend(&self, viewer_id: &str, entries: HashMap<String, bool>) {
        let mut cache = lock(&self.inner);
        for (comment_id, liked) in entries {
            cache.insert((viewer_id.to_string(), comment_id), liked);
        }
    }
}

impl Default for LikedCache {
    fn default() -> Self {
        Self::new(DEFAULT_LIKED_CAPACITY)
    }
}
