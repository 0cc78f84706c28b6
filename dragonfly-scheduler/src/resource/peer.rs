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

use super::piece::Piece;
use chrono::{DateTime, Utc};
use dragonfly_client_core::error::invalid_argument;
use dragonfly_client_core::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// PeerState is the per-task-participant FSM of §3 Peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,
    Receiving,
    Running,
    Succeeded,
    Failed,
    Leave,
    BackToSource,
}

impl PeerState {
    /// can_transition_to enforces the state diagram of §3 Peer. Terminal
    /// states (Succeeded/Failed/Leave) never transition further; a peer
    /// reaching `Succeeded` twice (e.g. a duplicate finished-piece event
    /// landing after the task already finished it) is a no-op, not an error,
    /// handled by the caller rather than here.
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Pending, Receiving)
                | (Pending, Failed)
                | (Pending, Leave)
                | (Pending, BackToSource)
                | (Receiving, Running)
                | (Receiving, Failed)
                | (Receiving, Leave)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Leave)
                | (Running, BackToSource)
                | (BackToSource, Running)
                | (BackToSource, Succeeded)
                | (BackToSource, Failed)
                | (BackToSource, Leave)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Succeeded | PeerState::Failed | PeerState::Leave)
    }

    pub fn is_schedulable_as_parent(self) -> bool {
        matches!(self, PeerState::Running | PeerState::Succeeded)
    }
}

/// Priority mirrors the client-supplied scheduling priority hint that
/// governs whether a peer is allowed to back-source (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Level0,
    Level1,
    Level2,
    Level3,
    Level4,
    Level5,
    Level6,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Level0
    }
}

#[derive(Debug, Clone)]
pub struct CostStats {
    pub total_bytes: u64,
    pub total_cost: std::time::Duration,
}

impl Default for CostStats {
    fn default() -> Self {
        Self {
            total_bytes: 0,
            total_cost: std::time::Duration::ZERO,
        }
    }
}

/// Peer is one participant (a specific host) in a specific task (§3 Peer).
pub struct Peer {
    pub id: String,
    pub host_id: String,
    pub task_id: String,
    pub priority: Priority,
    state: RwLock<PeerState>,
    finished_pieces: RwLock<HashMap<u32, Piece>>,
    block_parents: RwLock<HashSet<String>>,
    pub need_back_to_source: std::sync::atomic::AtomicBool,
    pub cost_stats: RwLock<CostStats>,
    pub created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
}

impl Peer {
    pub fn new(id: String, host_id: String, task_id: String, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            host_id,
            task_id,
            priority,
            state: RwLock::new(PeerState::Pending),
            finished_pieces: RwLock::new(HashMap::new()),
            block_parents: RwLock::new(HashSet::new()),
            need_back_to_source: std::sync::atomic::AtomicBool::new(false),
            cost_stats: RwLock::new(CostStats::default()),
            created_at: now,
            updated_at: RwLock::new(now),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    /// transition moves the peer's FSM forward, rejecting transitions the
    /// state diagram (§3 Peer) disallows.
    pub fn transition(&self, next: PeerState) -> Result<()> {
        let mut state = self.state.write();
        if *state == next {
            return Ok(());
        }
        if !state.can_transition_to(next) {
            return Err(invalid_argument(format!(
                "peer {} cannot transition {:?} -> {:?}",
                self.id, *state, next
            )));
        }
        debug!(peer_id = %self.id, from = ?*state, to = ?next, "peer state transition");
        *state = next;
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn touch(&self) {
        *self.updated_at.write() = Utc::now();
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.read()
    }

    /// is_idle_since reports whether this peer has had no state transition
    /// for longer than `ttl`, used by the peer GC sweep (§5).
    pub fn is_idle_since(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.updated_at() > ttl
    }

    /// add_finished_piece records a piece this peer has fully downloaded.
    /// Piece numbers are a set (§5 "addition of distinct piece numbers"):
    /// processing the same piece twice, from any interleaving of concurrent
    /// `DownloadPieceFinishedRequest`s, is idempotent.
    pub fn add_finished_piece(&self, piece: Piece) {
        self.finished_pieces.write().insert(piece.number, piece);
    }

    pub fn finished_piece_count(&self) -> u64 {
        self.finished_pieces.read().len() as u64
    }

    pub fn has_finished_piece(&self, number: u32) -> bool {
        self.finished_pieces.read().contains_key(&number)
    }

    pub fn finished_piece_numbers(&self) -> HashSet<u32> {
        self.finished_pieces.read().keys().copied().collect()
    }

    /// finished_piece_ratio is the Evaluator's finished-piece-ratio term
    /// (§4.3), relative to `total`. A task with an unknown piece count (0)
    /// scores 0 so it never dominates candidate ranking before the total is
    /// known.
    pub fn finished_piece_ratio(&self, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (self.finished_piece_count() as f64 / total as f64).min(1.0)
    }

    pub fn block_parent(&self, parent_id: impl Into<String>) {
        self.block_parents.write().insert(parent_id.into());
    }

    pub fn is_blocked(&self, parent_id: &str) -> bool {
        self.block_parents.read().contains(parent_id)
    }

    pub fn blocked_parents(&self) -> HashSet<String> {
        self.block_parents.read().clone()
    }

    pub fn record_cost(&self, bytes: u64, cost: std::time::Duration) {
        let mut stats = self.cost_stats.write();
        stats.total_bytes += bytes;
        stats.total_cost += cost;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(n: u32) -> Piece {
        Piece {
            number: n,
            offset: 0,
            length: 0,
            digest: String::new(),
            parent_id: None,
            cost: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_finished_piece_is_idempotent() {
        let peer = Peer::new("p1".into(), "h1".into(), "t1".into(), Priority::Level0);
        peer.add_finished_piece(piece(0));
        peer.add_finished_piece(piece(0));
        assert_eq!(peer.finished_piece_count(), 1);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let peer = Peer::new("p1".into(), "h1".into(), "t1".into(), Priority::Level0);
        assert!(peer.transition(PeerState::Succeeded).is_err());
    }

    #[test]
    fn valid_transition_chain_succeeds() {
        let peer = Peer::new("p1".into(), "h1".into(), "t1".into(), Priority::Level0);
        peer.transition(PeerState::Receiving).unwrap();
        peer.transition(PeerState::Running).unwrap();
        peer.transition(PeerState::Succeeded).unwrap();
        assert_eq!(peer.state(), PeerState::Succeeded);
    }

    #[test]
    fn finished_piece_ratio_is_bounded() {
        let peer = Peer::new("p1".into(), "h1".into(), "t1".into(), Priority::Level0);
        peer.add_finished_piece(piece(0));
        assert_eq!(peer.finished_piece_ratio(0), 0.0);
        assert_eq!(peer.finished_piece_ratio(2), 0.5);
    }
}
