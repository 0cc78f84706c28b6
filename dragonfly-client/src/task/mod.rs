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

use crate::grpc::scheduler::SchedulerClient;
use crate::resource::piece_synchronizer::{
    Outcome, ParentClientFactory, PieceSynchronizer, SchedulerReporter, SynchronizerConfig,
};
use crate::resource::Parent;
use async_trait::async_trait;
use dragonfly_api::scheduler::v2::{
    announce_peer_request, announce_peer_response, AnnouncePeerRequest, DownloadPieceFailedRequest,
    DownloadPieceFinishedRequest, Piece as PbPiece, RegisterPeerRequest as PbRegisterPeerRequest,
    ReschedulePeerRequest,
};
use dragonfly_client_backend::OriginBackend;
use dragonfly_client_config::dfdaemon::DownloadConfig;
use dragonfly_client_core::{
    error::{invalid_argument, no_candidate},
    Result,
};
use dragonfly_client_storage::PieceStore;
use dragonfly_client_util::digest::sha256_hex;
use dragonfly_client_util::id_generator::IdGenerator;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_stream::StreamExt;
use tracing::{info, instrument, warn};

/// Task owns every collaborator a download needs: id derivation, the
/// scheduler duplex stream, local piece storage and the origin backend for
/// back-to-source. It mirrors the teacher's `task::Task`, which every grpc
/// handler in `dfdaemon.rs` reaches through `self.task`.
pub struct Task {
    pub id_generator: Arc<IdGenerator>,
    pub scheduler_client: Arc<SchedulerClient>,
    pub piece: Arc<PieceStore>,
    pub backend: Arc<OriginBackend>,
    pub config: DownloadConfig,
    pub parent_factory: Arc<dyn ParentClientFactory>,
}

impl Task {
    pub fn new(
        id_generator: Arc<IdGenerator>,
        scheduler_client: Arc<SchedulerClient>,
        piece: Arc<PieceStore>,
        backend: Arc<OriginBackend>,
        config: DownloadConfig,
        parent_factory: Arc<dyn ParentClientFactory>,
    ) -> Self {
        Self {
            id_generator,
            scheduler_client,
            piece,
            backend,
            config,
            parent_factory,
        }
    }

    /// download_task_started records that a download has begun, matching
    /// the teacher's method of the same name.
    pub fn download_task_started(&self, _task_id: &str, _piece_length: Option<u64>) -> Result<()> {
        Ok(())
    }

    pub fn download_task_finished(&self, task_id: &str) -> Result<()> {
        info!(task_id, "download task finished");
        Ok(())
    }

    pub fn download_task_failed(&self, task_id: &str) -> Result<()> {
        info!(task_id, "download task failed");
        Ok(())
    }

    /// get_content_length resolves the task's total size from the origin,
    /// used to derive the piece count before the first schedule call (§4.1).
    #[instrument(skip(self, header))]
    pub async fn get_content_length(
        &self,
        task_id: &str,
        url: &str,
        header: HashMap<String, String>,
    ) -> Result<u64> {
        let head = self.backend.head(url, header).await?;
        head.content_length
            .ok_or_else(|| invalid_argument(format!("origin did not report content length for {task_id}")))
    }

    /// download_pieces drives the Piece Synchronizer (§4.6) for a whole
    /// task, given the candidate parents the Scheduler handed back from
    /// `RegisterPeerRequest`. Back-to-source fetching of individual pieces
    /// once `Outcome::NeedBackToSource` fires is the caller's
    /// responsibility, since only the caller knows the task's source URL
    /// and headers.
    #[instrument(skip(self, reporter, parents))]
    pub async fn download_pieces(
        &self,
        task_id: &str,
        piece_length: u64,
        piece_count: u32,
        parents: Vec<Parent>,
        reporter: Arc<dyn SchedulerReporter>,
    ) -> Result<Outcome> {
        let synchronizer = PieceSynchronizer::new(
            task_id.to_string(),
            piece_length,
            self.piece.clone(),
            self.parent_factory.clone(),
            reporter,
            SynchronizerConfig {
                piece_download_timeout: self.config.piece_download_timeout,
                reschedule_peer_timeout: self.config.reschedule_peer_timeout,
                concurrent_piece_count: self.config.concurrent_piece_count as usize,
            },
        );
        let interested: Vec<u32> = (0..piece_count).collect();
        synchronizer.run(interested, parents).await
    }

    /// back_to_source_piece fetches one piece directly from the origin and
    /// persists it, used when the Piece Synchronizer gives up on every
    /// parent (§4.6 Fallback).
    #[instrument(skip(self, header))]
    pub async fn back_to_source_piece(
        &self,
        task_id: &str,
        url: &str,
        number: u32,
        offset: u64,
        length: u64,
        header: HashMap<String, String>,
    ) -> Result<()> {
        let content = self.backend.download_piece(url, offset, length, header).await?;
        let digest = sha256_hex(&content);
        self.piece
            .finished(task_id, number, offset, digest, None, None, &content)
            .await
    }

    /// run registers the peer with the scheduler over a dedicated
    /// `AnnouncePeer` stream (§4.5), drives the Piece Synchronizer against
    /// whatever candidates the first response carries, and falls back to
    /// fetching every still-missing piece directly from the origin if the
    /// synchronizer reports `NeedBackToSource` (§4.6 "Fallback", §4.7).
    #[instrument(skip(self, header), fields(task_id, peer_id))]
    pub async fn run(
        &self,
        task_id: &str,
        peer_id: &str,
        host_id: &str,
        url: &str,
        piece_length: u64,
        piece_count: u32,
        header: HashMap<String, String>,
    ) -> Result<()> {
        let (out_tx, out_rx) = mpsc::channel(128);
        let mut in_stream = self.scheduler_client.announce_peer(out_rx).await?.into_inner();

        out_tx
            .send(AnnouncePeerRequest {
                request: Some(announce_peer_request::Request::RegisterPeerRequest(
                    PbRegisterPeerRequest {
                        task_id: task_id.to_string(),
                        peer_id: peer_id.to_string(),
                        host_id: host_id.to_string(),
                        download: Some(dragonfly_api::common::v2::Download {
                            url: url.to_string(),
                            piece_length: Some(piece_length),
                            header: header.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )),
            })
            .await
            .map_err(|_| no_candidate("scheduler stream closed before register"))?;

        let first = in_stream
            .next()
            .await
            .ok_or_else(|| no_candidate("scheduler closed stream without a response"))??;

        let parents = match first.response {
            Some(announce_peer_response::Response::NeedBackToSourceResponse(_)) | None => Vec::new(),
            Some(announce_peer_response::Response::EmptyTaskResponse(_)) => {
                return Ok(());
            }
            Some(announce_peer_response::Response::NormalTaskResponse(r)) => {
                r.candidate_parents.into_iter().map(pb_peer_to_parent).collect()
            }
            Some(announce_peer_response::Response::TinyTaskResponse(_)) => return Ok(()),
        };

        let reporter: Arc<dyn SchedulerReporter> = Arc::new(AnnouncePeerReporter {
            out_tx,
            in_stream: AsyncMutex::new(in_stream),
        });

        if parents.is_empty() {
            warn!(task_id, "no initial candidates, falling back to back-to-source");
            return self
                .back_to_source_all(task_id, url, piece_length, piece_count, header)
                .await;
        }

        match self
            .download_pieces(task_id, piece_length, piece_count, parents, reporter)
            .await?
        {
            Outcome::AllPiecesFinished => self.download_task_finished(task_id),
            Outcome::NeedBackToSource => {
                self.back_to_source_all(task_id, url, piece_length, piece_count, header)
                    .await?;
                self.download_task_finished(task_id)
            }
        }
    }

    /// back_to_source_all fetches every piece of the task directly from
    /// origin, used once the Piece Synchronizer gives up (§4.6 Fallback).
    /// Pieces already persisted by a prior partial synchronizer run are
    /// fetched again; `PieceStore::finished` overwrites idempotently.
    async fn back_to_source_all(
        &self,
        task_id: &str,
        url: &str,
        piece_length: u64,
        piece_count: u32,
        header: HashMap<String, String>,
    ) -> Result<()> {
        for number in 0..piece_count {
            let offset = number as u64 * piece_length;
            self.back_to_source_piece(task_id, url, number, offset, piece_length, header.clone())
                .await?;
        }
        Ok(())
    }
}

fn pb_peer_to_parent(peer: dragonfly_api::common::v2::Peer) -> Parent {
    let host = peer.host.unwrap_or_default();
    Parent {
        id: peer.id,
        host_id: host.id,
        ip: host.ip,
        upload_port: host.port as u32,
    }
}

/// AnnouncePeerReporter implements `SchedulerReporter` on top of one
/// download's `AnnouncePeer` duplex stream (§4.4, §4.6 steps 6-7): piece
/// outcomes are sent as fire-and-forget requests, while `reschedule_peer`
/// sends a request and waits for the matching `NormalTaskResponse`.
struct AnnouncePeerReporter {
    out_tx: mpsc::Sender<AnnouncePeerRequest>,
    in_stream: AsyncMutex<tonic::Streaming<dragonfly_api::scheduler::v2::AnnouncePeerResponse>>,
}

impl AnnouncePeerReporter {
    fn envelope(&self, request: announce_peer_request::Request) -> AnnouncePeerRequest {
        AnnouncePeerRequest {
            request: Some(request),
        }
    }
}

#[async_trait]
impl SchedulerReporter for AnnouncePeerReporter {
    async fn download_piece_finished(&self, piece_number: u32, parent_id: &str, cost: std::time::Duration) {
        let _ = self
            .out_tx
            .send(self.envelope(announce_peer_request::Request::DownloadPieceFinishedRequest(
                DownloadPieceFinishedRequest {
                    parent_id: Some(parent_id.to_string()),
                    piece: Some(PbPiece {
                        number: piece_number,
                        parent_id: parent_id.to_string(),
                        cost: Some(dragonfly_api::google::protobuf::Duration {
                            seconds: cost.as_secs() as i64,
                            nanos: cost.subsec_nanos() as i32,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )))
            .await;
    }

    async fn download_piece_failed(&self, piece_number: u32, parent_id: &str, is_back_to_source: bool) {
        let _ = self
            .out_tx
            .send(self.envelope(announce_peer_request::Request::DownloadPieceFailedRequest(
                DownloadPieceFailedRequest {
                    piece_number: Some(piece_number),
                    parent_id: Some(parent_id.to_string()),
                    temporary: !is_back_to_source,
                    ..Default::default()
                },
            )))
            .await;
    }

    async fn reschedule_peer(&self) -> Result<Vec<Parent>> {
        self.out_tx
            .send(self.envelope(announce_peer_request::Request::ReschedulePeerRequest(
                ReschedulePeerRequest::default(),
            )))
            .await
            .map_err(|_| no_candidate("scheduler stream closed during reschedule"))?;

        let mut in_stream = self.in_stream.lock().await;
        let reply = in_stream
            .next()
            .await
            .ok_or_else(|| no_candidate("scheduler closed stream during reschedule"))??;

        match reply.response {
            Some(announce_peer_response::Response::NormalTaskResponse(r)) => {
                Ok(r.candidate_parents.into_iter().map(pb_peer_to_parent).collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}
