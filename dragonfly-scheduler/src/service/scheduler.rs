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

use super::evaluator::{Candidate, Evaluator, NetworkTopology};
use super::seed::{select_seed_host, SeedTrigger};
use crate::resource::host::HostType;
use crate::resource::manager::{HostManager, TaskManager};
use crate::resource::peer::{Peer, PeerState, Priority};
use crate::resource::piece::Piece;
use crate::resource::task::{Digest, TaskState};
use dragonfly_client_backend::OriginBackend;
use dragonfly_client_config::scheduler::SchedulerConfig;
use dragonfly_client_core::error::{back_to_source_exceeded, no_candidate};
use dragonfly_client_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// RegisterPeerResponse is the scheduler's reply to `RegisterPeerRequest`
/// (§4.5 "Scheduler → Client messages").
pub enum RegisterPeerResponse {
    Empty,
    Tiny { content: Vec<u8> },
    Small { parent: Arc<Peer> },
    Normal { candidates: Vec<Arc<Peer>> },
    NeedBackToSource,
}

/// SchedulerCore implements the state-machine drivers of §4.4: it is the
/// single place that mutates Task/Peer/Host state in response to client
/// events, delegating ranking to the Evaluator and seed fallback to a
/// `SeedTrigger`.
pub struct SchedulerCore {
    pub tasks: Arc<TaskManager>,
    pub hosts: Arc<HostManager>,
    evaluator: Evaluator,
    topology: Arc<dyn NetworkTopology>,
    seed_trigger: Arc<dyn SeedTrigger>,
    config: SchedulerConfig,
    backend: Arc<OriginBackend>,
}

impl SchedulerCore {
    pub fn new(
        tasks: Arc<TaskManager>,
        hosts: Arc<HostManager>,
        evaluator: Evaluator,
        topology: Arc<dyn NetworkTopology>,
        seed_trigger: Arc<dyn SeedTrigger>,
        config: SchedulerConfig,
        backend: Arc<OriginBackend>,
    ) -> Self {
        Self {
            tasks,
            hosts,
            evaluator,
            topology,
            seed_trigger,
            config,
            backend,
        }
    }

    /// register_peer implements §4.4 "On RegisterPeer(req)".
    #[instrument(skip(self, content_length, digest))]
    pub async fn register_peer(
        &self,
        task_id: &str,
        url: &str,
        piece_length: u64,
        content_length: Option<u64>,
        digest: Option<Digest>,
        peer_id: &str,
        host_id: &str,
        priority: Priority,
    ) -> Result<RegisterPeerResponse> {
        let entry = self.tasks.get_or_create(
            task_id,
            url,
            piece_length,
            digest,
            self.config.back_to_source_count,
        );
        if let Some(len) = content_length {
            entry.task.set_content_length(len);
        }

        let guard = entry.mutex.lock().await;

        // Step 2: tiny/small direct response for an already-succeeded task.
        if entry.task.state() == TaskState::Succeeded {
            if let Some(len) = entry.task.content_length() {
                if len <= self.config.tiny_task_size_threshold.as_u64() {
                    drop(guard);
                    let content = self.resolve_direct_piece(&entry, url, len).await?;
                    return Ok(RegisterPeerResponse::Tiny { content });
                }
                if len <= self.config.small_task_size_threshold.as_u64() {
                    let parent = entry
                        .peers
                        .iter()
                        .find(|e| e.value().state() == PeerState::Succeeded)
                        .map(|e| e.value().clone());
                    if let Some(parent) = parent {
                        drop(guard);
                        return Ok(RegisterPeerResponse::Small { parent });
                    }
                }
            }
        }

        // Step 3: load-or-create Host, Peer; transition Peer to Pending.
        let child = entry.get_or_create_peer(peer_id, host_id, priority);
        child.transition(PeerState::Pending)?;

        // Step 4: a Pending task has no content yet; trigger seed fallback
        // and let the client wait for ReschedulePeerRequest.
        if entry.task.state() == TaskState::Pending {
            entry.task.transition(TaskState::Running)?;
            drop(guard);
            self.trigger_seed_or_back_to_source(task_id).await;
            return Ok(RegisterPeerResponse::Normal { candidates: Vec::new() });
        }
        drop(guard);

        // Step 5: invoke Evaluator and stream back candidate parents.
        let candidates = self.evaluate_candidates(task_id, &child)?;
        if candidates.is_empty() {
            return Ok(RegisterPeerResponse::NeedBackToSource);
        }
        Ok(RegisterPeerResponse::Normal { candidates })
    }

    /// evaluate_candidates re-runs the Evaluator for `child`, used both by
    /// `register_peer` and `ReschedulePeerRequest` (§4.4 step 5, "On
    /// ReschedulePeerRequest"). Every candidate actually returned reserves an
    /// upload slot on its host (§5 "Scoped resources", §9 bullet 6); a
    /// candidate that loses the reservation race against a concurrent
    /// schedule call is dropped rather than offered over-limit.
    fn evaluate_candidates(&self, task_id: &str, child: &Arc<Peer>) -> Result<Vec<Arc<Peer>>> {
        let entry = self.tasks.get(task_id)?;
        let child_host = self.hosts.get(&child.host_id)?;

        let candidates: Vec<Candidate> = entry
            .peers
            .iter()
            .filter(|e| e.key() != &child.id)
            .filter_map(|e| {
                let peer = e.value().clone();
                self.hosts.get(&peer.host_id).ok().map(|host| Candidate { peer, host })
            })
            .collect();

        let ranked = self.evaluator.evaluate(
            child,
            &child_host,
            &entry.graph,
            entry.task.total_piece_count() as u64,
            &candidates,
            self.topology.as_ref(),
            self.config.filter_parent_limit as usize,
        );

        Ok(ranked
            .into_iter()
            .filter(|parent| match self.hosts.get(&parent.host_id) {
                Ok(host) => host.acquire_upload_slot(),
                Err(_) => false,
            })
            .collect())
    }

    /// resolve_direct_piece returns a tiny task's whole content, fetching it
    /// from origin once and caching it on the `Task` entity for every later
    /// `RegisterPeer` (§4.4 step 2, `TinyTaskResponse`).
    async fn resolve_direct_piece(
        &self,
        entry: &crate::resource::manager::TaskEntry,
        url: &str,
        content_length: u64,
    ) -> Result<Vec<u8>> {
        if let Some(cached) = entry.task.direct_piece() {
            return Ok(cached);
        }
        let content = self
            .backend
            .download_piece(url, 0, content_length, std::collections::HashMap::new())
            .await?;
        entry.task.set_direct_piece_once(content.clone());
        Ok(content)
    }

    /// reschedule_peer implements §4.4 "On ReschedulePeerRequest".
    #[instrument(skip(self))]
    pub async fn reschedule_peer(
        &self,
        task_id: &str,
        peer_id: &str,
    ) -> Result<RegisterPeerResponse> {
        let entry = self.tasks.get(task_id)?;
        let child = entry.get_peer(peer_id)?;
        let candidates = self.evaluate_candidates(task_id, &child)?;
        if candidates.is_empty() {
            return Ok(RegisterPeerResponse::NeedBackToSource);
        }
        Ok(RegisterPeerResponse::Normal { candidates })
    }

    /// download_piece_finished implements §4.4 "On DownloadPieceFinishedRequest".
    #[instrument(skip(self, piece))]
    pub async fn download_piece_finished(
        &self,
        task_id: &str,
        peer_id: &str,
        parent_id: &str,
        piece: Piece,
        cost: Duration,
    ) -> Result<()> {
        let entry = self.tasks.get(task_id)?;
        let child = entry.get_peer(peer_id)?;

        if let Ok(parent) = entry.get_peer(parent_id) {
            if let Ok(parent_host) = self.hosts.get(&parent.host_id) {
                parent_host.record_upload_success();
                parent_host.release_upload_slot();
            }
        }

        let guard = entry.mutex.lock().await;
        child.add_finished_piece(piece);
        child.record_cost(0, cost);

        let total = entry.task.total_piece_count();
        let finished = child.finished_piece_count() as u32;
        if total > 0 && finished >= total {
            child.transition(PeerState::Succeeded)?;
            if entry.task.state() != TaskState::Succeeded {
                entry.task.set_total_piece_count_once(total);
                entry.task.transition(TaskState::Succeeded)?;
                info!(task_id, peer_id, "task succeeded via first completing peer");
            }
        }
        drop(guard);
        Ok(())
    }

    /// download_piece_failed implements §4.4 "On DownloadPieceFailedRequest".
    #[instrument(skip(self))]
    pub async fn download_piece_failed(
        &self,
        task_id: &str,
        peer_id: &str,
        parent_id: &str,
        is_back_to_source_reason: bool,
    ) -> Result<RegisterPeerResponse> {
        let entry = self.tasks.get(task_id)?;
        let child = entry.get_peer(peer_id)?;

        if let Ok(parent) = entry.get_peer(parent_id) {
            if let Ok(parent_host) = self.hosts.get(&parent.host_id) {
                parent_host.record_upload_failure();
                parent_host.release_upload_slot();
            }
        }
        child.block_parent(parent_id);

        if is_back_to_source_reason && self.peer_may_back_to_source(&child) {
            child.need_back_to_source.store(true, std::sync::atomic::Ordering::SeqCst);
            return Ok(RegisterPeerResponse::NeedBackToSource);
        }

        let candidates = self.evaluate_candidates(task_id, &child)?;
        if candidates.is_empty() {
            return Err(no_candidate(format!(
                "no candidate parent left for peer {peer_id} of task {task_id}"
            )));
        }
        Ok(RegisterPeerResponse::Normal { candidates })
    }

    /// peer_may_back_to_source applies priority + task policy (§4.4 step 4
    /// of DownloadPieceFailedRequest): any peer above the lowest priority
    /// level is allowed to take on back-to-source duty directly, matching
    /// the intent that Level0 (default/background) peers should prefer to
    /// wait for a reschedule instead of burdening origin.
    fn peer_may_back_to_source(&self, peer: &Peer) -> bool {
        peer.priority > Priority::Level0
    }

    /// download_peer_failed implements §4.4 "On DownloadPeerFailedRequest /
    /// stream close without success".
    #[instrument(skip(self))]
    pub async fn download_peer_failed(&self, task_id: &str, peer_id: &str) -> Result<()> {
        let entry = self.tasks.get(task_id)?;
        let child = entry.get_peer(peer_id)?;

        let guard = entry.mutex.lock().await;
        if child.state().is_terminal() {
            drop(guard);
            return Ok(());
        }
        if child.transition(PeerState::Failed).is_err() {
            let _ = child.transition(PeerState::Leave);
        }
        entry.remove_peer(peer_id);

        let running = entry.running_peer_count();
        let task_state = entry.task.state();
        drop(guard);

        if running == 0 && task_state != TaskState::Succeeded {
            if entry.task.try_start_back_to_source() {
                self.trigger_seed_or_back_to_source(task_id).await;
            } else {
                warn!(task_id, "back-to-source limit exceeded, failing task");
                entry.task.transition(TaskState::Failed)?;
                for entry_peer in entry.peers.iter() {
                    let _ = entry_peer.value().transition(PeerState::Failed);
                }
                return Err(back_to_source_exceeded(format!(
                    "task {task_id} exceeded back-to-source limit"
                )));
            }
        }
        Ok(())
    }

    /// leave_peer removes a peer that cleanly left the swarm (`LeavePeer`
    /// RPC, §4.5).
    pub fn leave_peer(&self, task_id: &str, peer_id: &str) -> Result<()> {
        let entry = self.tasks.get(task_id)?;
        if let Ok(peer) = entry.get_peer(peer_id) {
            let _ = peer.transition(PeerState::Leave);
        }
        entry.remove_peer(peer_id);
        Ok(())
    }

    /// trigger_seed_or_back_to_source implements §4.7: select an
    /// affinity-ranked seed host and issue `TriggerDownloadTask`; if no
    /// seed is available or the trigger fails, the caller already recorded
    /// a `NeedBackToSourceResponse`/failure path, so this only logs.
    async fn trigger_seed_or_back_to_source(&self, task_id: &str) {
        let Ok(entry) = self.tasks.get(task_id) else {
            return;
        };
        let seed_hosts: Vec<Arc<crate::resource::Host>> = self
            .hosts_snapshot()
            .into_iter()
            .filter(|h| h.host_type.is_seed())
            .collect();

        let Some(seed_host) = select_seed_host(&seed_hosts) else {
            info!(task_id, "no seed host available, client must back-to-source");
            return;
        };

        if let Err(err) = self
            .seed_trigger
            .trigger_download_task(&seed_host, task_id, &entry.task.url)
            .await
        {
            warn!(task_id, seed_host_id = %seed_host.id, %err, "seed trigger failed, falling back to client back-to-source");
        }
    }

    fn hosts_snapshot(&self) -> Vec<Arc<crate::resource::Host>> {
        // HostManager does not expose raw iteration outside the crate;
        // route through a narrow accessor kept here so callers outside
        // `resource` never depend on its internal map type.
        self.hosts.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Host;
    use crate::service::evaluator::NoopNetworkTopology;
    use dragonfly_client_config::scheduler::EvaluatorWeightsConfig;

    fn core() -> SchedulerCore {
        SchedulerCore::new(
            Arc::new(TaskManager::new()),
            Arc::new(HostManager::new()),
            Evaluator::new(EvaluatorWeightsConfig::default()),
            Arc::new(NoopNetworkTopology),
            Arc::new(super::super::seed::NoopSeedTrigger),
            SchedulerConfig::default(),
            Arc::new(OriginBackend::new()),
        )
    }

    #[tokio::test]
    async fn register_peer_on_pending_task_triggers_running_with_empty_candidates() {
        let core = core();
        core.hosts.upsert(Host::new(
            "h1".into(),
            "10.0.0.1".into(),
            "node".into(),
            8080,
            8081,
            HostType::Normal,
            10,
        ));

        let response = core
            .register_peer("t1", "https://x/y", 4194304, None, None, "p1", "h1", Priority::Level0)
            .await
            .unwrap();
        match response {
            RegisterPeerResponse::Normal { candidates } => assert!(candidates.is_empty()),
            _ => panic!("expected Normal response with empty candidates"),
        }
        assert_eq!(core.tasks.get("t1").unwrap().task.state(), TaskState::Running);
    }

    #[tokio::test]
    async fn download_piece_finished_completes_task_on_last_piece() {
        let core = core();
        core.hosts.upsert(Host::new(
            "h1".into(), "10.0.0.1".into(), "node".into(), 8080, 8081, HostType::Normal, 10,
        ));
        core.hosts.upsert(Host::new(
            "h2".into(), "10.0.0.2".into(), "seed".into(), 8080, 8081, HostType::Normal, 10,
        ));
        let entry = core.tasks.get_or_create("t1", "https://x/y", 4194304, None, 1);
        entry.task.transition(TaskState::Running).unwrap();
        entry.task.set_total_piece_count_once(1);
        let child = entry.get_or_create_peer("child", "h1", Priority::Level0);
        child.transition(PeerState::Receiving).unwrap();
        child.transition(PeerState::Running).unwrap();
        let parent = entry.get_or_create_peer("parent", "h2", Priority::Level0);
        parent.transition(PeerState::Receiving).unwrap();
        parent.transition(PeerState::Running).unwrap();

        core.download_piece_finished(
            "t1",
            "child",
            "parent",
            Piece {
                number: 0,
                offset: 0,
                length: 4194304,
                digest: "sha256:abc".into(),
                parent_id: Some("parent".into()),
                cost: None,
                created_at: chrono::Utc::now(),
            },
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(entry.task.state(), TaskState::Succeeded);
        assert_eq!(child.state(), PeerState::Succeeded);
    }

    #[tokio::test]
    async fn download_peer_failed_triggers_back_to_source_when_no_running_peers_remain() {
        let core = core();
        core.hosts.upsert(Host::new(
            "h1".into(), "10.0.0.1".into(), "node".into(), 8080, 8081, HostType::Normal, 10,
        ));
        let entry = core.tasks.get_or_create("t1", "https://x/y", 4194304, None, 1);
        entry.task.transition(TaskState::Running).unwrap();
        let child = entry.get_or_create_peer("child", "h1", Priority::Level0);
        child.transition(PeerState::Receiving).unwrap();
        child.transition(PeerState::Running).unwrap();

        core.download_peer_failed("t1", "child").await.unwrap();
        assert_eq!(entry.task.back_to_source_count(), 1);
    }

    #[tokio::test]
    async fn download_peer_failed_fails_task_once_back_to_source_limit_hit() {
        let core = core();
        core.hosts.upsert(Host::new(
            "h1".into(), "10.0.0.1".into(), "node".into(), 8080, 8081, HostType::Normal, 10,
        ));
        let entry = core.tasks.get_or_create("t1", "https://x/y", 4194304, None, 0);
        entry.task.transition(TaskState::Running).unwrap();
        let child = entry.get_or_create_peer("child", "h1", Priority::Level0);
        child.transition(PeerState::Receiving).unwrap();
        child.transition(PeerState::Running).unwrap();

        let result = core.download_peer_failed("t1", "child").await;
        assert!(result.is_err());
        assert_eq!(entry.task.state(), TaskState::Failed);
    }
}
