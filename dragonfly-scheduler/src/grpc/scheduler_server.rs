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

use crate::networktopology::probe::NetworkTopology as ProbeNetworkTopology;
use crate::resource::host::HostType as DomainHostType;
use crate::resource::manager::HostManager;
use crate::resource::peer::{PeerState, Priority};
use crate::resource::piece::Piece as DomainPiece;
use crate::resource::task::TaskState;
use crate::resource::Host as DomainHost;
use crate::service::scheduler::{RegisterPeerResponse, SchedulerCore};
use dragonfly_api::common::v2::{Host as PbHost, Network as PbNetwork, Priority as PbPriority};
use dragonfly_api::scheduler::v2::{
    announce_peer_request, announce_peer_response, scheduler_server::Scheduler,
    AnnounceHostRequest, AnnouncePeerRequest, AnnouncePeerResponse, DeleteHostRequest,
    DeleteTaskRequest, EmptyTaskResponse, ExchangePeerRequest, ExchangePeerResponse,
    LeavePeerRequest, NeedBackToSourceResponse, NormalTaskResponse, Peer as PbPeer,
    StatPeerRequest, StatTaskRequest, SyncProbesRequest, SyncProbesResponse, TinyTaskResponse,
};
use dragonfly_api::google::protobuf::Empty;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};
use tracing::{error, info, instrument, Instrument, Span};

/// SchedulerGrpcServer exposes `SchedulerCore` over the wire (§4.5
/// "AnnouncePeer Stream Handler", §6 RPCs).
pub struct SchedulerGrpcServer {
    addr: SocketAddr,
    core: Arc<SchedulerCore>,
    topology: Arc<ProbeNetworkTopology>,
}

impl SchedulerGrpcServer {
    pub fn new(addr: SocketAddr, core: Arc<SchedulerCore>, topology: Arc<ProbeNetworkTopology>) -> Self {
        Self { addr, core, topology }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: crate::shutdown::Shutdown) {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(dragonfly_api::FILE_DESCRIPTOR_SET)
            .build()
            .unwrap();

        let service = dragonfly_api::scheduler::v2::scheduler_server::SchedulerServer::new(
            SchedulerHandler {
                core: self.core.clone(),
                topology: self.topology.clone(),
            },
        );

        info!("scheduler grpc server listening on {}", self.addr);
        tonic::transport::Server::builder()
            .add_service(reflection)
            .add_service(service)
            .serve_with_shutdown(self.addr, async move {
                shutdown.recv().await;
                info!("scheduler grpc server shutting down");
            })
            .await
            .unwrap();
    }
}

struct SchedulerHandler {
    core: Arc<SchedulerCore>,
    topology: Arc<ProbeNetworkTopology>,
}

fn pb_priority_to_domain(priority: i32) -> Priority {
    match PbPriority::try_from(priority).unwrap_or(PbPriority::LevelUnknown) {
        PbPriority::Level1 => Priority::Level1,
        PbPriority::Level2 => Priority::Level2,
        PbPriority::Level3 => Priority::Level3,
        PbPriority::Level4 => Priority::Level4,
        PbPriority::Level5 => Priority::Level5,
        PbPriority::Level6 => Priority::Level6,
        _ => Priority::Level0,
    }
}

/// peer_state_to_pb maps the domain FSM to the wire's plain-string state
/// field, the same convention `AnnounceHostRequest.r#type` already uses for
/// `HostType` (snake_case strings rather than a generated enum).
fn peer_state_to_pb(state: PeerState) -> String {
    match state {
        PeerState::Pending => "Pending",
        PeerState::Receiving => "Receiving",
        PeerState::Running => "Running",
        PeerState::Succeeded => "Succeeded",
        PeerState::Failed => "Failed",
        PeerState::Leave => "Leave",
        PeerState::BackToSource => "BackToSource",
    }
    .to_string()
}

fn task_state_to_pb(state: TaskState) -> String {
    match state {
        TaskState::Pending => "Pending",
        TaskState::Running => "Running",
        TaskState::Succeeded => "Succeeded",
        TaskState::Failed => "Failed",
        TaskState::Leave => "Leave",
    }
    .to_string()
}

fn peer_to_pb(peer: &crate::resource::Peer, host: &DomainHost) -> PbPeer {
    PbPeer {
        id: peer.id.clone(),
        state: peer_state_to_pb(peer.state()),
        host: Some(host_to_pb(host)),
        ..Default::default()
    }
}

fn host_to_pb(host: &DomainHost) -> PbHost {
    PbHost {
        id: host.id.clone(),
        ip: host.ip.clone(),
        hostname: host.hostname.clone(),
        port: host.port as i32,
        download_port: host.download_port as i32,
        network: host.network.location.clone().map(|location| PbNetwork {
            location,
            idc: host.network.idc.clone().unwrap_or_default(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn response_to_pb(
    response: RegisterPeerResponse,
    core: &SchedulerCore,
    task_id: &str,
    peer_id: &str,
) -> announce_peer_response::Response {
    match response {
        RegisterPeerResponse::Empty => {
            announce_peer_response::Response::EmptyTaskResponse(EmptyTaskResponse {})
        }
        RegisterPeerResponse::Tiny { content } => {
            announce_peer_response::Response::TinyTaskResponse(TinyTaskResponse {
                task_id: task_id.to_string(),
                peer_id: peer_id.to_string(),
                content,
            })
        }
        RegisterPeerResponse::Small { parent } => {
            let host = core
                .hosts
                .get(&parent.host_id)
                .unwrap_or_else(|_| Arc::new(DomainHost::new(
                    parent.host_id.clone(), String::new(), String::new(), 0, 0, DomainHostType::Normal, 0,
                )));
            announce_peer_response::Response::NormalTaskResponse(NormalTaskResponse {
                candidate_parents: vec![peer_to_pb(&parent, &host)],
                ..Default::default()
            })
        }
        RegisterPeerResponse::Normal { candidates } => {
            let candidate_parents = candidates
                .iter()
                .filter_map(|peer| core.hosts.get(&peer.host_id).ok().map(|host| peer_to_pb(peer, &host)))
                .collect();
            let _ = task_id;
            announce_peer_response::Response::NormalTaskResponse(NormalTaskResponse {
                candidate_parents,
                ..Default::default()
            })
        }
        RegisterPeerResponse::NeedBackToSource => {
            announce_peer_response::Response::NeedBackToSourceResponse(NeedBackToSourceResponse {})
        }
    }
}

#[tonic::async_trait]
impl Scheduler for SchedulerHandler {
    type AnnouncePeerStream = Pin<Box<dyn Stream<Item = Result<AnnouncePeerResponse, Status>> + Send + 'static>>;

    /// announce_peer drains the tagged-union client stream of §4.5 and
    /// drives `SchedulerCore`'s state machine, replying on the matching
    /// outbound stream.
    #[instrument(skip_all, fields(task_id, peer_id))]
    async fn announce_peer(
        &self,
        request: Request<tonic::Streaming<AnnouncePeerRequest>>,
    ) -> Result<Response<Self::AnnouncePeerStream>, Status> {
        let mut in_stream = request.into_inner();
        let core = self.core.clone();
        let (out_tx, out_rx) = mpsc::channel(128);

        tokio::spawn(
            async move {
                let mut task_id = String::new();
                let mut peer_id = String::new();

                loop {
                    let message = match tokio::time::timeout(Duration::from_secs(120), in_stream.next()).await {
                        Ok(Some(Ok(message))) => message,
                        Ok(Some(Err(err))) => {
                            error!(%err, "announce peer stream error");
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            // Per-stream inactivity deadline (§4.4 "Timeouts").
                            if !task_id.is_empty() && !peer_id.is_empty() {
                                let _ = core.download_peer_failed(&task_id, &peer_id).await;
                            }
                            break;
                        }
                    };

                    let Some(req) = message.request else { continue };
                    let result = handle_request(&core, &mut task_id, &mut peer_id, req).await;
                    match result {
                        Ok(Some(response)) => {
                            let reply = AnnouncePeerResponse { response: Some(response) };
                            if out_tx.send(Ok(reply)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let _ = out_tx.send(Err(Status::from(err))).await;
                            break;
                        }
                    }
                }
            }
            .instrument(Span::current()),
        );

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }

    #[instrument(skip_all, fields(peer_id))]
    async fn stat_peer(&self, request: Request<StatPeerRequest>) -> Result<Response<PbPeer>, Status> {
        let req = request.into_inner();
        let entry = self.core.tasks.get(&req.task_id).map_err(Status::from)?;
        let peer = entry.get_peer(&req.peer_id).map_err(Status::from)?;
        let host = self.core.hosts.get(&peer.host_id).map_err(Status::from)?;
        Ok(Response::new(peer_to_pb(&peer, &host)))
    }

    #[instrument(skip_all, fields(peer_id))]
    async fn leave_peer(&self, request: Request<LeavePeerRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.core.leave_peer(&req.task_id, &req.peer_id).map_err(Status::from)?;
        Ok(Response::new(Empty {}))
    }

    #[instrument(skip_all)]
    async fn exchange_peer(&self, request: Request<ExchangePeerRequest>) -> Result<Response<ExchangePeerResponse>, Status> {
        let _ = request;
        Ok(Response::new(ExchangePeerResponse::default()))
    }

    #[instrument(skip_all, fields(task_id))]
    async fn stat_task(&self, request: Request<StatTaskRequest>) -> Result<Response<dragonfly_api::common::v2::Task>, Status> {
        let req = request.into_inner();
        let entry = self.core.tasks.get(&req.id).map_err(Status::from)?;
        Ok(Response::new(dragonfly_api::common::v2::Task {
            id: entry.task.id.clone(),
            state: task_state_to_pb(entry.task.state()),
            content_length: entry.task.content_length().unwrap_or(0),
            piece_length: entry.task.piece_length,
            ..Default::default()
        }))
    }

    #[instrument(skip_all)]
    async fn delete_task(&self, request: Request<DeleteTaskRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.core.tasks.remove(&req.id);
        Ok(Response::new(Empty {}))
    }

    #[instrument(skip_all, fields(host_id))]
    async fn announce_host(&self, request: Request<AnnounceHostRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let host_type = match req.r#type.as_str() {
            "super_seed" => DomainHostType::SuperSeed,
            "strong_seed" => DomainHostType::StrongSeed,
            "weak_seed" => DomainHostType::WeakSeed,
            _ => DomainHostType::Normal,
        };
        self.core.hosts.upsert(DomainHost::new(
            req.id,
            req.ip,
            req.hostname,
            req.port as u32,
            req.download_port as u32,
            host_type,
            req.concurrent_upload_limit.unwrap_or(50),
        ));
        Ok(Response::new(Empty {}))
    }

    #[instrument(skip_all, fields(host_id))]
    async fn delete_host(&self, request: Request<DeleteHostRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.core.hosts.remove(&req.host_id);
        Ok(Response::new(Empty {}))
    }

    type SyncProbesStream = Pin<Box<dyn Stream<Item = Result<SyncProbesResponse, Status>> + Send + 'static>>;

    /// sync_probes implements §4.8's client-driven RTT reporting: clients
    /// stream measured probes between hosts, the scheduler persists the
    /// EWMA via the Probes subsystem.
    #[instrument(skip_all)]
    async fn sync_probes(
        &self,
        request: Request<tonic::Streaming<SyncProbesRequest>>,
    ) -> Result<Response<Self::SyncProbesStream>, Status> {
        let mut in_stream = request.into_inner();
        let topology = self.topology.clone();
        let (out_tx, out_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(Ok(message)) = in_stream.next().await {
                let Some(src) = message.host.as_ref().map(|h| h.id.clone()) else { continue };
                for probe in message.probes {
                    let Some(dst) = probe.host.as_ref().map(|h| h.id.clone()) else { continue };
                    let rtt = probe
                        .rtt
                        .map(|d| Duration::new(d.seconds.max(0) as u64, d.nanos.max(0) as u32))
                        .unwrap_or_default();
                    topology.enqueue(&src, &dst, rtt).await;
                }
            }
            let _ = out_tx.send(Ok(SyncProbesResponse::default())).await;
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }
}

async fn handle_request(
    core: &SchedulerCore,
    task_id: &mut String,
    peer_id: &mut String,
    req: announce_peer_request::Request,
) -> dragonfly_client_core::Result<Option<announce_peer_response::Response>> {
    use announce_peer_request::Request::*;

    match req {
        RegisterPeerRequest(r) => {
            *task_id = r.task_id.clone();
            *peer_id = r.peer_id.clone();
            let host_id = r.host_id.clone();
            let priority = pb_priority_to_domain(r.priority);
            let response = core
                .register_peer(
                    &r.task_id,
                    &r.download.as_ref().map(|d| d.url.clone()).unwrap_or_default(),
                    r.download.as_ref().map(|d| d.piece_length).unwrap_or(4 * 1024 * 1024) as u64,
                    None,
                    None,
                    &r.peer_id,
                    &host_id,
                    priority,
                )
                .await?;
            Ok(Some(response_to_pb(response, core, task_id, peer_id)))
        }
        ReschedulePeerRequest(_) => {
            let response = core.reschedule_peer(task_id, peer_id).await?;
            Ok(Some(response_to_pb(response, core, task_id, peer_id)))
        }
        DownloadPieceFinishedRequest(r) => {
            let cost = r
                .piece
                .as_ref()
                .and_then(|p| p.cost.clone())
                .map(|d| Duration::new(d.seconds.max(0) as u64, d.nanos.max(0) as u32))
                .unwrap_or_default();
            let piece = r.piece.map(|p| DomainPiece {
                number: p.number,
                offset: p.offset,
                length: p.length,
                digest: p.digest,
                parent_id: p.parent_id,
                cost: Some(cost),
                created_at: chrono::Utc::now(),
            });
            if let Some(piece) = piece {
                core.download_piece_finished(
                    task_id,
                    peer_id,
                    &r.parent_id.unwrap_or_default(),
                    piece,
                    cost,
                )
                .await?;
            }
            Ok(None)
        }
        DownloadPieceFailedRequest(r) => {
            let response = core
                .download_piece_failed(
                    task_id,
                    peer_id,
                    &r.parent_id.unwrap_or_default(),
                    r.temporary,
                )
                .await?;
            Ok(Some(response_to_pb(response, core, task_id, peer_id)))
        }
        DownloadPeerFailedRequest(_) => {
            core.download_peer_failed(task_id, peer_id).await?;
            Ok(None)
        }
        DownloadPeerFinishedRequest(_) => Ok(None),
        _ => Ok(None),
    }
}
