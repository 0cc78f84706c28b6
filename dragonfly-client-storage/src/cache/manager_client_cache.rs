/*
 *     Copyright 2023 The Dragonfly Authors
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

use super::lru_cache::LruCache;
use chrono::{DateTime, Utc};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// ManagerClientCache is a small TTL-bounded cache for Manager responses
/// (`ListSchedulers`, `ListApplications`) that the scheduler's dynamic
/// configuration and the Evaluator's affinity terms read from (spec §6:
/// "cached with local TTL, default 10 min"). It is built on the same `lru`
/// wrapper the client uses for piece content, sized generously since Manager
/// responses are small and few.
pub struct ManagerClientCache<V: Clone> {
    entries: Mutex<LruCache<String, (V, DateTime<Utc>)>>,
    ttl: Duration,
}

impl<V: Clone> ManagerClientCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// get returns the cached value for `key` if present and not yet expired.
    /// An expired entry is left in place; the next `put` for the same key
    /// overwrites it, matching the teacher's read-through refresh idiom.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        let (value, cached_at) = entries.get(&key.to_string())?;
        if Utc::now() - *cached_at > chrono_ttl(self.ttl) {
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, key: String, value: V) {
        self.entries.lock().unwrap().put(key, (value, Utc::now()));
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_cached_value_within_ttl() {
        let cache = ManagerClientCache::new(4, Duration::from_secs(600));
        cache.put("schedulers".to_string(), vec!["s1".to_string()]);
        assert_eq!(cache.get("schedulers"), Some(vec!["s1".to_string()]));
    }

    #[test]
    fn misses_on_unknown_key() {
        let cache: ManagerClientCache<Vec<String>> = ManagerClientCache::new(4, Duration::from_secs(600));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn treats_zero_ttl_as_always_expired() {
        let cache = ManagerClientCache::new(4, Duration::from_secs(0));
        cache.put("schedulers".to_string(), vec!["s1".to_string()]);
        assert_eq!(cache.get("schedulers"), None);
    }
}
