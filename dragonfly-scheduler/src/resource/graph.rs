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

use dashmap::DashMap;
use dragonfly_client_core::error::{cycle, same_host};
use dragonfly_client_core::Result;
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};

/// MAX_ANCESTOR_DEPTH bounds the ancestor walk so `Ancestors` always
/// terminates (§4.2: "bounded depth, must terminate") even if some future
/// bug lets a very long chain of parents accumulate.
const MAX_ANCESTOR_DEPTH: usize = 256;

struct Vertex {
    host_id: String,
    parents: HashSet<String>,
    children: HashSet<String>,
}

/// Graph is the per-task directed acyclic graph of peer-to-peer parent/child
/// relationships (§3 "Peer-graph edges", §4.2). One `Graph` exists per Task.
///
/// Per-vertex data lives behind a `DashMap`, so unrelated vertices' reads
/// (e.g. listing a peer's current children for a progress query) never
/// contend with each other. Structural mutation — adding or removing an
/// edge, which must check for cycles across the whole graph before
/// committing — is additionally guarded by `mutation_lock` so that `AddEdge`
/// and ancestor checks stay linearizable with respect to each other, per
/// §4.2's invariant.
pub struct Graph {
    vertices: DashMap<String, Vertex>,
    mutation_lock: RwLock<()>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            vertices: DashMap::new(),
            mutation_lock: RwLock::new(()),
        }
    }

    /// add_peer inserts a peer vertex. Idempotent on `peer_id` (§4.2).
    pub fn add_peer(&self, peer_id: &str, host_id: &str) {
        self.vertices.entry(peer_id.to_string()).or_insert_with(|| Vertex {
            host_id: host_id.to_string(),
            parents: HashSet::new(),
            children: HashSet::new(),
        });
    }

    pub fn len_vertex(&self) -> usize {
        self.vertices.len()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.vertices.contains_key(peer_id)
    }

    /// add_edge adds a parent -> child edge, rejecting it with `ErrSameHost`
    /// if the two peers share a host, or `ErrCycle` if it would close a
    /// cycle (§4.2, §3 Peer invariants, §8 property 1 & 2).
    pub fn add_edge(&self, parent_id: &str, child_id: &str) -> Result<()> {
        if parent_id == child_id {
            return Err(cycle(format!("peer {parent_id} cannot be its own parent")));
        }

        let _guard = self.mutation_lock.write();

        let (parent_host, child_host) = {
            let parent = self
                .vertices
                .get(parent_id)
                .ok_or_else(|| cycle(format!("unknown parent {parent_id}")))?;
            let child = self
                .vertices
                .get(child_id)
                .ok_or_else(|| cycle(format!("unknown child {child_id}")))?;
            (parent.host_id.clone(), child.host_id.clone())
        };

        if parent_host == child_host {
            return Err(same_host(format!(
                "parent {parent_id} and child {child_id} share host {parent_host}"
            )));
        }

        // Adding parent -> child would close a cycle iff child is already an
        // ancestor of parent (a path child ~> ... ~> parent already exists).
        if self.is_ancestor_locked(child_id, parent_id) {
            return Err(cycle(format!(
                "adding {parent_id} -> {child_id} would create a cycle"
            )));
        }

        if let Some(mut parent) = self.vertices.get_mut(parent_id) {
            parent.children.insert(child_id.to_string());
        }
        if let Some(mut child) = self.vertices.get_mut(child_id) {
            child.parents.insert(parent_id.to_string());
        }
        Ok(())
    }

    /// delete_peer removes a vertex and every incident edge atomically with
    /// respect to concurrent `add_edge` calls (§3 "Ownership").
    pub fn delete_peer(&self, peer_id: &str) {
        let _guard = self.mutation_lock.write();
        let Some((_, vertex)) = self.vertices.remove(peer_id) else {
            return;
        };
        for parent_id in &vertex.parents {
            if let Some(mut parent) = self.vertices.get_mut(parent_id) {
                parent.children.remove(peer_id);
            }
        }
        for child_id in &vertex.children {
            if let Some(mut child) = self.vertices.get_mut(child_id) {
                child.parents.remove(peer_id);
            }
        }
    }

    pub fn parents(&self, peer_id: &str) -> HashSet<String> {
        self.vertices
            .get(peer_id)
            .map(|v| v.parents.clone())
            .unwrap_or_default()
    }

    pub fn children(&self, peer_id: &str) -> HashSet<String> {
        self.vertices
            .get(peer_id)
            .map(|v| v.children.clone())
            .unwrap_or_default()
    }

    pub fn in_degree(&self, peer_id: &str) -> usize {
        self.parents(peer_id).len()
    }

    pub fn out_degree(&self, peer_id: &str) -> usize {
        self.children(peer_id).len()
    }

    /// ancestors performs a bounded-depth BFS over parent edges (§4.2).
    pub fn ancestors(&self, peer_id: &str) -> HashSet<String> {
        let _guard = self.mutation_lock.read();
        self.ancestors_locked(peer_id)
    }

    fn ancestors_locked(&self, peer_id: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((peer_id.to_string(), 0usize));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= MAX_ANCESTOR_DEPTH {
                continue;
            }
            let parents = self
                .vertices
                .get(&current)
                .map(|v| v.parents.clone())
                .unwrap_or_default();
            for parent in parents {
                if visited.insert(parent.clone()) {
                    queue.push_back((parent, depth + 1));
                }
            }
        }
        visited
    }

    fn is_ancestor_locked(&self, candidate: &str, of: &str) -> bool {
        self.ancestors_locked(of).contains(candidate)
    }

    /// range_vertex iterates a snapshot of the vertex-id set, matching
    /// §4.2's "concurrent-safe iteration; snapshots vertex set".
    pub fn range_vertex<F>(&self, mut f: F)
    where
        F: FnMut(&str),
    {
        let ids: Vec<String> = self.vertices.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            f(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_same_host_edge() {
        let graph = Graph::new();
        graph.add_peer("a", "h1");
        graph.add_peer("b", "h1");
        assert!(graph.add_edge("a", "b").is_err());
    }

    #[test]
    fn rejects_cycle() {
        let graph = Graph::new();
        graph.add_peer("a", "h1");
        graph.add_peer("b", "h2");
        graph.add_peer("c", "h3");
        graph.add_edge("a", "b").unwrap();
        graph.add_edge("b", "c").unwrap();
        assert!(graph.add_edge("c", "a").is_err(), "c -> a would close a cycle");
    }

    #[test]
    fn peer_never_ancestor_of_itself() {
        let graph = Graph::new();
        graph.add_peer("a", "h1");
        graph.add_peer("b", "h2");
        graph.add_edge("a", "b").unwrap();
        assert!(!graph.ancestors("a").contains("a"));
    }

    #[test]
    fn delete_peer_removes_incident_edges() {
        let graph = Graph::new();
        graph.add_peer("a", "h1");
        graph.add_peer("b", "h2");
        graph.add_peer("c", "h3");
        graph.add_edge("a", "b").unwrap();
        graph.add_edge("b", "c").unwrap();
        graph.delete_peer("b");
        assert!(!graph.contains("b"));
        assert!(graph.children("a").is_empty());
        assert!(graph.parents("c").is_empty());
    }

    #[test]
    fn ancestors_are_transitive() {
        let graph = Graph::new();
        graph.add_peer("a", "h1");
        graph.add_peer("b", "h2");
        graph.add_peer("c", "h3");
        graph.add_edge("a", "b").unwrap();
        graph.add_edge("b", "c").unwrap();
        let ancestors = graph.ancestors("c");
        assert!(ancestors.contains("a"));
        assert!(ancestors.contains("b"));
    }

    #[test]
    fn add_peer_is_idempotent() {
        let graph = Graph::new();
        graph.add_peer("a", "h1");
        graph.add_peer("a", "h1");
        assert_eq!(graph.len_vertex(), 1);
    }
}
