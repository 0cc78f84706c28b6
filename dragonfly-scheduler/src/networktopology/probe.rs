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

use super::kv::{KeyValueStore, Keys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Probe is a single RTT measurement from `SourceHost` to `DestinationHost`
/// (§3 Probe).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub host_id: String,
    pub rtt: Duration,
    pub created_at: DateTime<Utc>,
}

/// ewma_average_rtt computes the exponentially-weighted moving average of
/// §4.8 step 3: `avg = Σ(w_i × rtt_i) / Σ w_i`, where `w_i = 0.1 + 0.9 ×
/// (i/n)` so later (more recent) samples in `probes` weigh more. `probes`
/// must be in oldest-first order, matching the FIFO's `LRANGE` order.
pub fn ewma_average_rtt(probes: &[Probe]) -> Option<Duration> {
    let n = probes.len();
    if n == 0 {
        return None;
    }
    if n == 1 {
        return Some(probes[0].rtt);
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (i, probe) in probes.iter().enumerate() {
        let weight = 0.1 + 0.9 * (i as f64 / (n - 1) as f64);
        weighted_sum += weight * probe.rtt.as_secs_f64();
        weight_total += weight;
    }

    Some(Duration::from_secs_f64(weighted_sum / weight_total))
}

/// NetworkTopology owns the Probes subsystem (§4.8): enqueueing samples into
/// a bounded per-(source, destination) FIFO backed by a `KeyValueStore`, and
/// answering the Evaluator's `average_rtt` queries.
pub struct NetworkTopology {
    kv: Arc<dyn KeyValueStore>,
    queue_length: usize,
}

impl NetworkTopology {
    pub fn new(kv: Arc<dyn KeyValueStore>, queue_length: usize) -> Self {
        Self { kv, queue_length }
    }

    /// enqueue records a new RTT sample from `src_host_id` to
    /// `dst_host_id`, evicting the oldest sample first if the queue is at
    /// capacity, then recomputes and persists the moving average (§4.8
    /// "On Enqueue").
    pub async fn enqueue(&self, src_host_id: &str, dst_host_id: &str, rtt: Duration) {
        if let Err(err) = self.try_enqueue(src_host_id, dst_host_id, rtt).await {
            // Best-effort: the key-value store being unavailable must not
            // fail scheduling (§4.8 "Failure").
            warn!(src_host_id, dst_host_id, %err, "probe enqueue failed, degrading to best-effort");
        }
    }

    async fn try_enqueue(
        &self,
        src_host_id: &str,
        dst_host_id: &str,
        rtt: Duration,
    ) -> dragonfly_client_core::Result<()> {
        let list_key = Keys::probes_list(src_host_id, dst_host_id);

        if self.kv.llen(&list_key).await? >= self.queue_length {
            self.kv.lpop(&list_key).await?;
        }

        let probe = Probe {
            host_id: dst_host_id.to_string(),
            rtt,
            created_at: Utc::now(),
        };
        self.kv
            .rpush(&list_key, serde_json::to_string(&probe).unwrap())
            .await?;

        let probes = self.load_queue(src_host_id, dst_host_id).await?;
        let average = ewma_average_rtt(&probes).unwrap_or(rtt);

        let hash_key = Keys::average_rtt_hash(src_host_id, dst_host_id);
        self.kv
            .set(
                &hash_key,
                serde_json::json!({
                    "averageRTT": average.as_nanos() as i64,
                    "createdAt": probes.first().map(|p| p.created_at).unwrap_or(probe.created_at).to_rfc3339(),
                    "updatedAt": Utc::now().to_rfc3339(),
                })
                .to_string(),
            )
            .await?;

        self.kv
            .set(&Keys::probed_at(dst_host_id), Utc::now().to_rfc3339())
            .await?;
        self.kv.incr(&Keys::probed_count(dst_host_id)).await?;

        Ok(())
    }

    async fn load_queue(
        &self,
        src_host_id: &str,
        dst_host_id: &str,
    ) -> dragonfly_client_core::Result<Vec<Probe>> {
        let list_key = Keys::probes_list(src_host_id, dst_host_id);
        let raw = self.kv.lrange(&list_key, 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }

    /// peek returns the oldest probe for the pair. When the queue is full,
    /// this implements round-robin destination selection by popping and
    /// re-pushing the head so the next probe-scheduling pass picks a
    /// different destination (§4.8 "Peek()").
    pub async fn peek(&self, src_host_id: &str, dst_host_id: &str) -> Option<Probe> {
        let list_key = Keys::probes_list(src_host_id, dst_host_id);
        let len = self.kv.llen(&list_key).await.ok()?;
        if len == 0 {
            return None;
        }

        let head = self.kv.lpop(&list_key).await.ok()??;
        let probe: Probe = serde_json::from_str(&head).ok()?;

        if len >= self.queue_length {
            let _ = self.kv.rpush(&list_key, head).await;
        } else {
            // Queue was not full: put it back at the front conceptually by
            // re-enqueuing; since our backend is a plain list without
            // push-front, round-robin rotation only applies once the queue
            // has reached capacity, matching "when the queue is full,
            // Peek() rotates it" (§4.8).
            let _ = self.kv.rpush(&list_key, head).await;
        }

        Some(probe)
    }

    /// average_rtt returns the last computed EWMA for the pair, or `None`
    /// if nothing has been measured yet.
    pub async fn average_rtt(&self, src_host_id: &str, dst_host_id: &str) -> Option<Duration> {
        let hash_key = Keys::average_rtt_hash(src_host_id, dst_host_id);
        let raw = self.kv.get(&hash_key).await.ok()??;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        let nanos = value.get("averageRTT")?.as_i64()?;
        Some(Duration::from_nanos(nanos.max(0) as u64))
    }

    pub async fn probed_count(&self, dst_host_id: &str) -> i64 {
        self.kv
            .get(&Keys::probed_count(dst_host_id))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// SyncNetworkTopology adapts `NetworkTopology`'s async `average_rtt` to the
/// synchronous `evaluator::NetworkTopology` trait by keeping a small
/// read-through cache refreshed out of band (by the probe-collection loop),
/// so the Evaluator's scoring pass never awaits key-value I/O while holding
/// a task lock (§5 "must not be held across ... key-value store
/// operations").
pub struct CachedNetworkTopology {
    cache: dashmap::DashMap<(String, String), Duration>,
}

impl Default for CachedNetworkTopology {
    fn default() -> Self {
        Self {
            cache: dashmap::DashMap::new(),
        }
    }
}

impl CachedNetworkTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&self, src_host_id: &str, dst_host_id: &str, rtt: Duration) {
        self.cache
            .insert((src_host_id.to_string(), dst_host_id.to_string()), rtt);
    }
}

impl crate::service::evaluator::NetworkTopology for CachedNetworkTopology {
    fn average_rtt(&self, src_host_id: &str, dst_host_id: &str) -> Option<Duration> {
        self.cache
            .get(&(src_host_id.to_string(), dst_host_id.to_string()))
            .map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networktopology::kv::InMemoryKeyValueStore;

    fn probe(ms: u64) -> Probe {
        Probe {
            host_id: "dst".into(),
            rtt: Duration::from_millis(ms),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn ewma_weighs_recent_samples_more() {
        let probes: Vec<Probe> = [40, 35, 38, 36, 34].into_iter().map(probe).collect();
        let avg = ewma_average_rtt(&probes).unwrap();
        // Recent (34ms) samples pull the average below the simple mean (36.6ms).
        assert!(avg.as_millis() < 37);
        assert!(avg.as_millis() > 30);
    }

    #[tokio::test]
    async fn enqueue_evicts_oldest_once_queue_is_full() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let topology = NetworkTopology::new(kv.clone(), 5);

        for ms in [40, 35, 38, 36, 34] {
            topology.enqueue("src", "dst", Duration::from_millis(ms)).await;
        }
        let queue = topology.load_queue("src", "dst").await.unwrap();
        assert_eq!(queue.len(), 5);

        topology.enqueue("src", "dst", Duration::from_millis(30)).await;
        let queue = topology.load_queue("src", "dst").await.unwrap();
        assert_eq!(queue.len(), 5, "queue length must stay bounded at capacity");
        assert_eq!(queue[0].rtt, Duration::from_millis(35), "40ms sample must be evicted");
        assert_eq!(queue[4].rtt, Duration::from_millis(30));
    }

    #[tokio::test]
    async fn average_rtt_reflects_ewma_after_each_insert() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let topology = NetworkTopology::new(kv.clone(), 5);
        topology.enqueue("src", "dst", Duration::from_millis(40)).await;
        let avg1 = topology.average_rtt("src", "dst").await.unwrap();
        assert_eq!(avg1, Duration::from_millis(40));

        topology.enqueue("src", "dst", Duration::from_millis(20)).await;
        let avg2 = topology.average_rtt("src", "dst").await.unwrap();
        let queue = topology.load_queue("src", "dst").await.unwrap();
        assert_eq!(avg2, ewma_average_rtt(&queue).unwrap());
    }

    #[tokio::test]
    async fn probed_count_increments_per_enqueue() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let topology = NetworkTopology::new(kv.clone(), 5);
        topology.enqueue("src", "dst", Duration::from_millis(1)).await;
        topology.enqueue("src", "dst", Duration::from_millis(1)).await;
        assert_eq!(topology.probed_count("dst").await, 2);
    }
}
