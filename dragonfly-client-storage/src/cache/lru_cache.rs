/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use lru::LruCache as InnerLruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// LruCache is a thin, non-concurrent wrapper around the `lru` crate used to
/// bound the number of entries the client keeps warm in memory (piece
/// content, recent task lookups). Eviction is by entry count, not byte size;
/// callers that need byte-size bounds track `ByteSize` as the value type, as
/// the benchmarks do.
pub struct LruCache<K: Hash + Eq, V> {
    inner: InnerLruCache<K, V>,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: InnerLruCache::new(capacity),
        }
    }

    /// put inserts or updates `key`, evicting the least-recently-used entry
    /// if the cache is at capacity. Returns the previous value if `key` was
    /// already present.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.inner.put(key, value)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.inner.peek(key)
    }

    pub fn pop(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// pop_lru evicts and returns the least-recently-used entry, if any.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        self.inner.pop_lru()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache: LruCache<u32, u32> = LruCache::new(2);
        cache.put(1, 10);
        cache.put(2, 20);
        cache.get(&1);
        cache.put(3, 30);
        assert!(cache.peek(&2).is_none(), "least-recently-used entry should be evicted");
        assert_eq!(cache.peek(&1), Some(&10));
        assert_eq!(cache.peek(&3), Some(&30));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut cache: LruCache<u32, u32> = LruCache::new(0);
        cache.put(1, 1);
        assert_eq!(cache.len(), 1);
    }
}
