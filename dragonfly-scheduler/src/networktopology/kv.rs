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

use async_trait::async_trait;
use dragonfly_client_core::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// KeyValueStore is the opaque key-value backend the Probes subsystem needs
/// (§6 "Shared key-value store for Probes"): a bounded list per ordered
/// host pair, plus scalar metadata keys. The real deployment backs this
/// with Redis; `InMemoryKeyValueStore` below is a faithful same-semantics
/// stand-in used in tests and in single-node deployments, matching §4.8
/// "Failure": when the store is unavailable, probe collection degrades to
/// best-effort rather than hard-failing the scheduler.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn llen(&self, key: &str) -> Result<usize>;
    async fn lpop(&self, key: &str) -> Result<Option<String>>;
    async fn rpush(&self, key: &str, value: String) -> Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn set(&self, key: &str, value: String) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn incr(&self, key: &str) -> Result<i64>;
}

#[derive(Default)]
struct Store {
    lists: HashMap<String, VecDeque<String>>,
    scalars: HashMap<String, String>,
    counters: HashMap<String, i64>,
}

/// InMemoryKeyValueStore implements `KeyValueStore` over a process-local
/// map, used when no external Redis is configured and by unit tests.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    store: Mutex<Store>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.store.lock().lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .lock()
            .lists
            .get_mut(key)
            .and_then(|l| l.pop_front()))
    }

    async fn rpush(&self, key: &str, value: String) -> Result<()> {
        self.store
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let store = self.store.lock();
        let Some(list) = store.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let normalize = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = normalize(start);
        let stop = (normalize(stop) + 1).min(len);
        if start >= stop {
            return Ok(Vec::new());
        }
        Ok(list.iter().skip(start as usize).take((stop - start) as usize).cloned().collect())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.store.lock().scalars.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.lock().scalars.get(key).cloned())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut store = self.store.lock();
        let counter = store.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

/// Keys holds the exact key schemas of §6, which are bit-exact for
/// interoperability with alternate implementations speaking the same
/// key-value store.
pub struct Keys;

impl Keys {
    pub fn average_rtt_hash(src_host_id: &str, dst_host_id: &str) -> String {
        format!("networktopology:scheduler:{src_host_id}:{dst_host_id}")
    }

    pub fn probes_list(src_host_id: &str, dst_host_id: &str) -> String {
        format!("probes:scheduler:{src_host_id}:{dst_host_id}")
    }

    pub fn probed_at(dst_host_id: &str) -> String {
        format!("probedAt:scheduler:{dst_host_id}")
    }

    pub fn probed_count(dst_host_id: &str) -> String {
        format!("probedCount:scheduler:{dst_host_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rpush_and_lrange_round_trip() {
        let store = InMemoryKeyValueStore::new();
        store.rpush("k", "a".into()).await.unwrap();
        store.rpush("k", "b".into()).await.unwrap();
        assert_eq!(store.llen("k").await.unwrap(), 2);
        assert_eq!(store.lrange("k", 0, -1).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn lpop_removes_oldest() {
        let store = InMemoryKeyValueStore::new();
        store.rpush("k", "a".into()).await.unwrap();
        store.rpush("k", "b".into()).await.unwrap();
        assert_eq!(store.lpop("k").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.llen("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_counts_up_from_zero() {
        let store = InMemoryKeyValueStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
    }
}
