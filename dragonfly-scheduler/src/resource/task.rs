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

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use dragonfly_client_core::error::invalid_argument;
use dragonfly_client_core::Result;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// TaskState is the FSM of §3 Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Leave,
}

impl TaskState {
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Leave)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Leave)
                | (Failed, Running)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Leave)
    }
}

#[derive(Debug, Clone)]
pub struct Digest {
    pub algorithm: String,
    pub value: String,
}

/// Task is one content object (§3 Task).
pub struct Task {
    pub id: String,
    pub url: String,
    pub piece_length: u64,
    pub digest: Option<Digest>,
    pub back_to_source_limit: u32,
    content_length: AtomicI64,
    total_piece_count: AtomicU32,
    state: RwLock<TaskState>,
    back_to_source_count: AtomicU64,
    /// direct_piece caches a tiny task's whole content (§4.4 step 2,
    /// `TinyTaskResponse`), fetched once from origin and reused by every
    /// subsequent `RegisterPeer` for the same task.
    direct_piece: RwLock<Option<Vec<u8>>>,
    /// peer_ids is the set of peers ever registered for this task; the peer
    /// graph (§4.2) is the source of truth for edges, this is only used to
    /// fan failures out to every peer (§4.7, §7 `ErrBackToSourceExceeded`).
    pub peer_ids: DashSet<String>,
    pub created_at: DateTime<Utc>,
    updated_at: RwLock<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: String, url: String, piece_length: u64, digest: Option<Digest>, back_to_source_limit: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            url,
            piece_length,
            digest,
            back_to_source_limit,
            content_length: AtomicI64::new(-1),
            total_piece_count: AtomicU32::new(0),
            state: RwLock::new(TaskState::Pending),
            back_to_source_count: AtomicU64::new(0),
            direct_piece: RwLock::new(None),
            peer_ids: DashSet::new(),
            created_at: now,
            updated_at: RwLock::new(now),
        }
    }

    pub fn state(&self) -> TaskState {
        *self.state.read()
    }

    pub fn transition(&self, next: TaskState) -> Result<()> {
        let mut state = self.state.write();
        if *state == next {
            return Ok(());
        }
        if !state.can_transition_to(next) {
            return Err(invalid_argument(format!(
                "task {} cannot transition {:?} -> {:?}",
                self.id, *state, next
            )));
        }
        *state = next;
        drop(state);
        self.touch();
        Ok(())
    }

    pub fn content_length(&self) -> Option<u64> {
        let v = self.content_length.load(Ordering::SeqCst);
        if v < 0 {
            None
        } else {
            Some(v as u64)
        }
    }

    pub fn set_content_length(&self, length: u64) {
        self.content_length.store(length as i64, Ordering::SeqCst);
    }

    pub fn total_piece_count(&self) -> u32 {
        self.total_piece_count.load(Ordering::SeqCst)
    }

    /// set_total_piece_count_once populates `TotalPieceCount` the first time
    /// some peer finishes the task (§4.4 "DownloadPieceFinishedRequest",
    /// step 2), satisfying the invariant that a Succeeded task has
    /// `TotalPieceCount > 0` (§3 Task invariants).
    pub fn set_total_piece_count_once(&self, count: u32) {
        let _ = self
            .total_piece_count
            .compare_exchange(0, count, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn back_to_source_count(&self) -> u64 {
        self.back_to_source_count.load(Ordering::SeqCst)
    }

    /// try_start_back_to_source increments the task's back-to-source counter
    /// if it is still under `BackToSourceLimit` (§3 invariants, §4.4 step 4,
    /// §7 `ErrBackToSourceExceeded`). Returns false once the limit is hit.
    pub fn try_start_back_to_source(&self) -> bool {
        loop {
            let current = self.back_to_source_count.load(Ordering::SeqCst);
            if current >= self.back_to_source_limit as u64 {
                return false;
            }
            if self
                .back_to_source_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// direct_piece returns the cached tiny-task content, if it has already
    /// been fetched once (§4.4 step 2).
    pub fn direct_piece(&self) -> Option<Vec<u8>> {
        self.direct_piece.read().clone()
    }

    /// set_direct_piece_once caches tiny-task content the first time it is
    /// resolved, so concurrent `RegisterPeer`s for the same task reuse one
    /// origin fetch instead of each doing their own.
    pub fn set_direct_piece_once(&self, content: Vec<u8>) {
        let mut cached = self.direct_piece.write();
        if cached.is_none() {
            *cached = Some(content);
        }
    }

    pub fn touch(&self) {
        *self.updated_at.write() = Utc::now();
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        *self.updated_at.read()
    }

    pub fn is_idle_since(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.updated_at() > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn back_to_source_limit_is_enforced() {
        let task = Task::new("t1".into(), "https://x/y".into(), 4194304, None, 1);
        assert!(task.try_start_back_to_source());
        assert!(!task.try_start_back_to_source(), "limit of 1 must reject a second attempt");
    }

    #[test]
    fn total_piece_count_is_set_only_once() {
        let task = Task::new("t1".into(), "https://x/y".into(), 4194304, None, 1);
        task.set_total_piece_count_once(3);
        task.set_total_piece_count_once(9);
        assert_eq!(task.total_piece_count(), 3);
    }

    #[test]
    fn invalid_state_transition_rejected() {
        let task = Task::new("t1".into(), "https://x/y".into(), 4194304, None, 1);
        assert!(task.transition(TaskState::Succeeded).is_err());
    }
}
