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

use super::graph::Graph;
use super::host::Host;
use super::peer::{Peer, Priority};
use super::task::{Digest, Task};
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use dragonfly_client_core::error::not_found;
use dragonfly_client_core::Result;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

/// TaskEntry bundles a Task with the Peers and the per-task Graph that it
/// exclusively owns (§3 "Ownership"), plus the mutex that serializes that
/// task's state-machine transitions (§4.4 "Concurrency"). Peer/Host/Task
/// reference each other only by id, never by direct ownership (§9
/// "arena-plus-index"), so GC is just a map removal and stale references
/// become `ErrNotFound` lookups rather than dangling pointers.
pub struct TaskEntry {
    pub task: Arc<Task>,
    pub peers: DashMap<String, Arc<Peer>>,
    pub graph: Graph,
    /// mutex serializes this task's FSM transitions; it must never be held
    /// across network I/O or another task's lock (§4.4, §5).
    pub mutex: AsyncMutex<()>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        Self {
            task: Arc::new(task),
            peers: DashMap::new(),
            graph: Graph::new(),
            mutex: AsyncMutex::new(()),
        }
    }
}

/// TaskManager is the process-wide owner of every live Task (§9 "Global
/// mutable state"). It is a thread-safe singleton; all operations are
/// lock-free at the map level (`DashMap`) with finer-grained locking inside
/// each `TaskEntry`.
#[derive(Default)]
pub struct TaskManager {
    tasks: DashMap<String, Arc<TaskEntry>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// get_or_create loads the task for `task_id`, creating it in `Pending`
    /// state on first sight (§3 Task "Lifecycle").
    pub fn get_or_create(
        &self,
        task_id: &str,
        url: &str,
        piece_length: u64,
        digest: Option<Digest>,
        back_to_source_limit: u32,
    ) -> Arc<TaskEntry> {
        self.tasks
            .entry(task_id.to_string())
            .or_insert_with(|| {
                Arc::new(TaskEntry::new(Task::new(
                    task_id.to_string(),
                    url.to_string(),
                    piece_length,
                    digest,
                    back_to_source_limit,
                )))
            })
            .clone()
    }

    pub fn get(&self, task_id: &str) -> Result<Arc<TaskEntry>> {
        self.tasks
            .get(task_id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found(format!("task {task_id} not found")))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// remove deletes a task entirely. Called on `Leave` and on TTL GC.
    pub fn remove(&self, task_id: &str) {
        if self.tasks.remove(task_id).is_some() {
            info!(task_id, "task removed");
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// sweep_expired removes every task whose last update predates `ttl`
    /// and which has already reached a terminal state, or has no peers left
    /// (§5 GC "three independent sweepers").
    pub fn sweep_expired(&self, ttl: ChronoDuration) -> Vec<String> {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| {
                let task = &entry.value().task;
                (task.state().is_terminal() || entry.value().peers.is_empty())
                    && task.is_idle_since(ttl)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for task_id in &expired {
            self.remove(task_id);
        }
        expired
    }

    /// sweep_expired_peers removes every peer, across every task, that has
    /// reached a terminal state and had no activity for longer than `ttl`
    /// (§5 GC, the peer sweeper independent of the task and host sweepers).
    pub fn sweep_expired_peers(&self, ttl: ChronoDuration) -> Vec<String> {
        let mut expired = Vec::new();
        for entry in self.tasks.iter() {
            let task_entry = entry.value();
            let expired_peer_ids: Vec<String> = task_entry
                .peers
                .iter()
                .filter(|peer_entry| {
                    let peer = peer_entry.value();
                    peer.state().is_terminal() && peer.is_idle_since(ttl)
                })
                .map(|peer_entry| peer_entry.key().clone())
                .collect();

            for peer_id in expired_peer_ids {
                task_entry.peers.remove(&peer_id);
                expired.push(peer_id);
            }
        }
        expired
    }
}

impl TaskEntry {
    /// get_or_create_peer loads or creates a peer under this task, linking
    /// it into the peer graph (§3 Peer "Lifecycle").
    pub fn get_or_create_peer(
        &self,
        peer_id: &str,
        host_id: &str,
        priority: Priority,
    ) -> Arc<Peer> {
        let peer = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                Arc::new(Peer::new(
                    peer_id.to_string(),
                    host_id.to_string(),
                    self.task.id.clone(),
                    priority,
                ))
            })
            .clone();
        self.graph.add_peer(peer_id, host_id);
        self.task.peer_ids.insert(peer_id.to_string());
        peer
    }

    pub fn get_peer(&self, peer_id: &str) -> Result<Arc<Peer>> {
        self.peers
            .get(peer_id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found(format!("peer {peer_id} not found")))
    }

    /// remove_peer deletes a peer from both the peer map and the graph
    /// atomically from the caller's point of view (§3 Peer "Lifecycle",
    /// "destroyed on stream close + TTL").
    pub fn remove_peer(&self, peer_id: &str) {
        self.graph.delete_peer(peer_id);
        self.peers.remove(peer_id);
        self.task.peer_ids.remove(peer_id);
    }

    /// running_peer_count counts peers that can currently serve pieces
    /// (§4.4 "task's running peers fall below a threshold").
    pub fn running_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|e| e.value().state() == super::peer::PeerState::Running)
            .count()
    }
}

/// HostManager is the process-wide owner of every live Host (§9 "Global
/// mutable state"), refreshed by `AnnounceHost` and expired by `LeaveHost`
/// or TTL (§3 Host "Lifecycle").
#[derive(Default)]
pub struct HostManager {
    hosts: DashMap<String, Arc<Host>>,
}

impl HostManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, host: Host) -> Arc<Host> {
        let host = Arc::new(host);
        self.hosts.insert(host.id.clone(), host.clone());
        host
    }

    pub fn get(&self, host_id: &str) -> Result<Arc<Host>> {
        self.hosts
            .get(host_id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found(format!("host {host_id} not found")))
    }

    pub fn remove(&self, host_id: &str) {
        self.hosts.remove(host_id);
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// snapshot returns every currently-live host, used by the seed-peer
    /// trigger to rank candidates without exposing `HostManager`'s internal
    /// map type to callers outside `resource` (§4.7).
    pub fn snapshot(&self) -> Vec<Arc<Host>> {
        self.hosts.iter().map(|e| e.value().clone()).collect()
    }

    /// sweep_expired removes hosts idle for longer than `ttl` (§5 GC).
    /// Referenced-by-peer bookkeeping lives in the caller (the scheduler
    /// core, which knows which hosts current peers reference); this sweep
    /// only applies the time bound.
    pub fn sweep_expired(&self, ttl: ChronoDuration) -> Vec<String> {
        let expired: Vec<String> = self
            .hosts
            .iter()
            .filter(|e| chrono::Utc::now() - e.value().updated_at() > ttl)
            .map(|e| e.key().clone())
            .collect();
        for host_id in &expired {
            self.hosts.remove(host_id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::host::HostType;

    #[test]
    fn task_manager_get_or_create_is_idempotent() {
        let manager = TaskManager::new();
        let a = manager.get_or_create("t1", "https://x/y", 4194304, None, 1);
        let b = manager.get_or_create("t1", "https://x/y", 4194304, None, 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn peer_lifecycle_updates_graph() {
        let manager = TaskManager::new();
        let entry = manager.get_or_create("t1", "https://x/y", 4194304, None, 1);
        entry.get_or_create_peer("p1", "h1", Priority::Level0);
        entry.get_or_create_peer("p2", "h2", Priority::Level0);
        entry.graph.add_edge("p1", "p2").unwrap();
        assert_eq!(entry.graph.len_vertex(), 2);

        entry.remove_peer("p1");
        assert!(entry.get_peer("p1").is_err());
        assert!(entry.graph.parents("p2").is_empty());
    }

    #[test]
    fn host_manager_round_trips() {
        let manager = HostManager::new();
        manager.upsert(Host::new(
            "h1".into(),
            "10.0.0.1".into(),
            "node-a".into(),
            8080,
            8081,
            HostType::Normal,
            10,
        ));
        assert!(manager.get("h1").is_ok());
        manager.remove("h1");
        assert!(manager.get("h1").is_err());
    }
}
