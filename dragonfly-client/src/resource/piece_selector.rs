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

use super::piece_collector::CollectedPiece;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{Mutex, Semaphore};

/// PieceSelector is designed to be used in a single-producer, single-consumer
/// pattern (§4.6 step 4, "pick the next unfetched piece"):
/// - the collector calls `insert()` to push pieces as parents report them ready.
/// - the synchronizer calls `select_with()` to pop a piece according to a
///   custom selection rule.
/// - a semaphore is used as a counting wakeup mechanism (no missed wakeups).
pub struct PieceSelector {
    buf: Arc<Mutex<Vec<CollectedPiece>>>,
    available: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl Default for PieceSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceSelector {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::new())),
            available: Arc::new(Semaphore::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// insert pushes a collected piece into the selector. Collector side
    /// only (SPSC).
    pub async fn insert(&self, piece: CollectedPiece) {
        {
            let mut buf = self.buf.lock().await;
            buf.push(piece);
        }
        self.available.add_permits(1);
    }

    /// close marks the selector closed. After close, `select_with` keeps
    /// draining existing pieces, then returns `None` once empty.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.available.add_permits(1);
    }

    pub async fn len(&self) -> usize {
        self.buf.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// select_with returns `None` only when closed and the buffer is empty.
    pub async fn select_with<F>(&self, mut select: F) -> Option<CollectedPiece>
    where
        F: FnMut(&[CollectedPiece]) -> usize,
    {
        loop {
            let _permit = self.available.acquire().await.ok()?;

            let mut buf = self.buf.lock().await;
            if buf.is_empty() {
                if self.closed.load(Ordering::Relaxed) {
                    return None;
                }
                // Spurious wakeup from a stale permit; keep waiting.
                continue;
            }

            let i = select(&buf);
            return Some(buf.swap_remove(i));
        }
    }

    pub async fn select_random(&self) -> Option<CollectedPiece> {
        self.select_with(|buf| fastrand::usize(..buf.len())).await
    }

    pub async fn select_fifo(&self) -> Option<CollectedPiece> {
        self.select_with(|_| 0).await
    }

    /// select_lowest_cost picks the piece whose parent reported the lowest
    /// `observed_cost` (§4.6 step 4, the default selection rule).
    pub async fn select_lowest_cost(&self) -> Option<CollectedPiece> {
        self.select_with(|buf| {
            buf.iter()
                .enumerate()
                .min_by_key(|(_, p)| p.observed_cost)
                .map(|(i, _)| i)
                .unwrap_or(0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::piece_collector::Parent;
    use std::time::Duration;

    fn piece(number: u32, cost_ms: u64) -> CollectedPiece {
        CollectedPiece {
            number,
            offset: 0,
            length: 4_194_304,
            parent: Parent {
                id: format!("p{number}"),
                host_id: "h1".into(),
                ip: "10.0.0.1".into(),
                upload_port: 4000,
            },
            observed_cost: Duration::from_millis(cost_ms),
        }
    }

    #[tokio::test]
    async fn fifo_returns_in_insertion_order() {
        let selector = PieceSelector::new();
        selector.insert(piece(0, 10)).await;
        selector.insert(piece(1, 5)).await;
        assert_eq!(selector.select_fifo().await.unwrap().number, 0);
        assert_eq!(selector.select_fifo().await.unwrap().number, 1);
    }

    #[tokio::test]
    async fn lowest_cost_wins_regardless_of_insertion_order() {
        let selector = PieceSelector::new();
        selector.insert(piece(0, 50)).await;
        selector.insert(piece(1, 5)).await;
        selector.insert(piece(2, 20)).await;
        assert_eq!(selector.select_lowest_cost().await.unwrap().number, 1);
    }

    #[tokio::test]
    async fn drains_then_returns_none_after_close() {
        let selector = PieceSelector::new();
        selector.insert(piece(0, 1)).await;
        selector.close();
        assert_eq!(selector.select_fifo().await.unwrap().number, 0);
        assert!(selector.select_fifo().await.is_none());
    }
}
