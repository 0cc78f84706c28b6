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

use super::piece_collector::{CollectedPiece, Parent};
use super::piece_selector::PieceSelector;
use async_trait::async_trait;
use dragonfly_client_core::error::{piece_digest_mismatch, timeout};
use dragonfly_client_core::Result;
use dragonfly_client_storage::PieceStore;
use dragonfly_client_util::digest;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_stream::{Stream, StreamExt};
use tracing::{error, instrument, warn};

/// DEFAULT_PARENT_COST_ESTIMATE seeds a parent's cost before any piece has
/// been downloaded from it, so an untried parent is neither favored nor
/// starved by `select_lowest_cost` against parents with a real track record.
const DEFAULT_PARENT_COST_ESTIMATE: Duration = Duration::from_millis(200);

/// PARENT_COST_EWMA_WEIGHT is how much a freshly observed cost moves a
/// parent's running estimate (§4.6 "lowest observed cost").
const PARENT_COST_EWMA_WEIGHT: f64 = 0.3;

/// ParentClient is the narrow interface the synchronizer needs from a
/// connection to one candidate parent (§4.6 steps 2, 5): stream the
/// finished-ness of interested pieces, then fetch a finished piece's bytes.
/// The real implementation is `grpc::dfdaemon::DfdaemonClient`, grounded on
/// the teacher's own `sync_pieces`/`download_piece` RPC pair.
#[async_trait]
pub trait ParentClient: Send + Sync {
    async fn sync_pieces(
        &self,
        task_id: &str,
        interested_piece_numbers: Vec<u32>,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = Result<u32>> + Send>>>;

    async fn download_piece(&self, task_id: &str, piece_number: u32) -> Result<DownloadedPiece>;
}

pub struct DownloadedPiece {
    pub offset: u64,
    pub length: u64,
    pub digest: String,
    pub content: Vec<u8>,
}

/// ParentClientFactory opens connections to candidate parents on demand, so
/// the synchronizer never needs to know the transport (grpc channel, unix
/// socket) behind a `Parent` descriptor.
#[async_trait]
pub trait ParentClientFactory: Send + Sync {
    async fn connect(&self, parent: &Parent) -> Result<Arc<dyn ParentClient>>;
}

/// SchedulerReporter is the narrow interface the synchronizer needs from the
/// `AnnouncePeer` stream to the Scheduler (§4.4, §4.6 steps 6-7).
#[async_trait]
pub trait SchedulerReporter: Send + Sync {
    async fn download_piece_finished(&self, piece_number: u32, parent_id: &str, cost: Duration);
    async fn download_piece_failed(&self, piece_number: u32, parent_id: &str, is_back_to_source: bool);
    async fn reschedule_peer(&self) -> Result<Vec<Parent>>;
}

/// Outcome is what `PieceSynchronizer::run` reports back to its caller, the
/// per-task download driver, once it stops making progress.
pub enum Outcome {
    AllPiecesFinished,
    NeedBackToSource,
}

pub struct SynchronizerConfig {
    pub piece_download_timeout: Duration,
    pub reschedule_peer_timeout: Duration,
    pub concurrent_piece_count: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            piece_download_timeout: Duration::from_secs(30),
            reschedule_peer_timeout: Duration::from_secs(8),
            concurrent_piece_count: 4,
        }
    }
}

/// PieceSynchronizer is the client-side piece download state machine of
/// §4.6: it maintains an ordered set of pieces to fetch, a bounded set of
/// assigned parents, and one piece-sync sub-stream per parent, picking the
/// next piece to download by lowest observed cost.
pub struct PieceSynchronizer {
    task_id: String,
    piece_length: u64,
    selector: Arc<PieceSelector>,
    blocked_parents: Mutex<HashSet<String>>,
    piece_store: Arc<PieceStore>,
    parent_factory: Arc<dyn ParentClientFactory>,
    scheduler: Arc<dyn SchedulerReporter>,
    config: SynchronizerConfig,
    /// parent_costs holds each parent's EWMA-smoothed observed cost (§4.6),
    /// read by `spawn_collectors` to stamp every newly collected piece and
    /// updated by `download_and_verify` once a real cost is measured.
    parent_costs: Arc<Mutex<HashMap<String, Duration>>>,
}

impl PieceSynchronizer {
    pub fn new(
        task_id: String,
        piece_length: u64,
        piece_store: Arc<PieceStore>,
        parent_factory: Arc<dyn ParentClientFactory>,
        scheduler: Arc<dyn SchedulerReporter>,
        config: SynchronizerConfig,
    ) -> Self {
        Self {
            task_id,
            piece_length,
            selector: Arc::new(PieceSelector::new()),
            blocked_parents: Mutex::new(HashSet::new()),
            piece_store,
            parent_factory,
            scheduler,
            config,
            parent_costs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// run drives the synchronizer until every piece in `interested` is
    /// finished locally, or the fallback of §4.6 ("Fallback") fires.
    #[instrument(skip_all, fields(task_id = %self.task_id))]
    pub async fn run(&self, interested: Vec<u32>, parents: Vec<Parent>) -> Result<Outcome> {
        let remaining = Arc::new(Mutex::new(interested.into_iter().collect::<HashSet<u32>>()));
        let mut spawned_parents = Vec::new();
        self.spawn_collectors(parents, remaining.clone(), &mut spawned_parents).await;

        let mut last_progress = tokio::time::Instant::now();
        let mut last_reschedule_attempt = tokio::time::Instant::now();

        loop {
            if remaining.lock().await.is_empty() {
                return Ok(Outcome::AllPiecesFinished);
            }

            let select = tokio::time::timeout(
                self.config.piece_download_timeout,
                self.selector.select_lowest_cost(),
            )
            .await;

            let piece = match select {
                Ok(Some(piece)) => piece,
                Ok(None) => return Ok(Outcome::AllPiecesFinished),
                Err(_) => {
                    // No parent supplied a piece within PieceDownloadTimeout.
                    if last_progress.elapsed() > self.config.piece_download_timeout
                        && last_reschedule_attempt.elapsed() > self.config.reschedule_peer_timeout
                    {
                        match self.scheduler.reschedule_peer().await {
                            Ok(fresh_parents) if !fresh_parents.is_empty() => {
                                last_reschedule_attempt = tokio::time::Instant::now();
                                self.spawn_collectors(fresh_parents, remaining.clone(), &mut spawned_parents)
                                    .await;
                                continue;
                            }
                            _ => {
                                warn!(task_id = %self.task_id, "no candidates after reschedule, requesting back-to-source");
                                return Ok(Outcome::NeedBackToSource);
                            }
                        }
                    }
                    continue;
                }
            };

            if self.blocked_parents.lock().await.contains(&piece.parent.id) {
                continue;
            }

            if !remaining.lock().await.contains(&piece.number) {
                // Already satisfied by another parent's race.
                continue;
            }

            match self.download_and_verify(&piece).await {
                Ok(cost) => {
                    remaining.lock().await.remove(&piece.number);
                    last_progress = tokio::time::Instant::now();
                    self.scheduler
                        .download_piece_finished(piece.number, &piece.parent.id, cost)
                        .await;
                }
                Err(err) => {
                    error!(piece_number = piece.number, parent_id = %piece.parent.id, %err, "piece download failed");
                    self.blocked_parents.lock().await.insert(piece.parent.id.clone());
                    self.scheduler
                        .download_piece_failed(piece.number, &piece.parent.id, false)
                        .await;
                }
            }
        }
    }

    async fn spawn_collectors(
        &self,
        parents: Vec<Parent>,
        remaining: Arc<Mutex<HashSet<u32>>>,
        spawned: &mut Vec<String>,
    ) {
        for parent in parents {
            if spawned.contains(&parent.id) {
                continue;
            }
            spawned.push(parent.id.clone());

            let Ok(client) = self.parent_factory.connect(&parent).await else {
                warn!(parent_id = %parent.id, "failed to connect to candidate parent");
                continue;
            };

            let interested: Vec<u32> = remaining.lock().await.iter().copied().collect();
            let task_id = self.task_id.clone();
            let piece_length = self.piece_length;
            let selector = self.selector.clone();
            let parent_for_task = parent.clone();
            let parent_costs = self.parent_costs.clone();

            tokio::spawn(async move {
                let Ok(mut stream) = client.sync_pieces(&task_id, interested).await else {
                    return;
                };
                while let Some(Ok(number)) = stream.next().await {
                    let observed_cost = parent_costs
                        .lock()
                        .await
                        .get(&parent_for_task.id)
                        .copied()
                        .unwrap_or(DEFAULT_PARENT_COST_ESTIMATE);
                    selector
                        .insert(CollectedPiece {
                            number,
                            offset: number as u64 * piece_length,
                            length: piece_length,
                            parent: parent_for_task.clone(),
                            observed_cost,
                        })
                        .await;
                }
            });
        }
    }

    /// download_and_verify implements §4.6 steps 5-7: range download, digest
    /// verification, local persistence. Returns the observed cost.
    async fn download_and_verify(&self, piece: &CollectedPiece) -> Result<Duration> {
        let client = self.parent_factory.connect(&piece.parent).await?;
        let started = tokio::time::Instant::now();
        let downloaded = client.download_piece(&self.task_id, piece.number).await?;
        let cost = started.elapsed();

        if !downloaded.digest.is_empty() && !digest::verify(&downloaded.content, &downloaded.digest) {
            return Err(piece_digest_mismatch(format!(
                "piece {} from parent {} failed digest verification",
                piece.number, piece.parent.id
            )));
        }

        self.piece_store
            .finished(
                &self.task_id,
                piece.number,
                downloaded.offset,
                downloaded.digest.clone(),
                Some(piece.parent.id.clone()),
                Some(cost),
                &downloaded.content,
            )
            .await?;

        if cost > self.config.piece_download_timeout {
            return Err(timeout(format!("piece {} download exceeded timeout", piece.number)));
        }

        self.update_parent_cost(&piece.parent.id, cost).await;
        Ok(cost)
    }

    /// update_parent_cost folds a freshly observed cost into the parent's
    /// running EWMA estimate, read by the next `spawn_collectors` insert for
    /// that parent.
    async fn update_parent_cost(&self, parent_id: &str, cost: Duration) {
        let mut costs = self.parent_costs.lock().await;
        let updated = match costs.get(parent_id) {
            Some(prev) => prev.mul_f64(1.0 - PARENT_COST_EWMA_WEIGHT) + cost.mul_f64(PARENT_COST_EWMA_WEIGHT),
            None => cost,
        };
        costs.insert(parent_id.to_string(), updated);
    }
}
