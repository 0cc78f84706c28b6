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

use crate::resource::piece_synchronizer::{DownloadedPiece, ParentClient, ParentClientFactory};
use crate::resource::Parent;
use crate::shutdown;
use crate::task;
use async_trait::async_trait;
use dragonfly_api::common::v2::Piece;
use dragonfly_api::dfdaemon::v2::{
    dfdaemon_client::DfdaemonClient as DfdaemonGRPCClient,
    dfdaemon_server::{Dfdaemon, DfdaemonServer as DfdaemonGRPCServer},
    DeleteTaskRequest, DownloadPieceRequest, DownloadPieceResponse, DownloadTaskRequest,
    DownloadTaskResponse, StatTaskRequest, SyncPiecesRequest, SyncPiecesResponse, UploadTaskRequest,
};
use dragonfly_client_core::Result as ClientResult;
use dragonfly_client_storage::DEFAULT_WAIT_FOR_PIECE_FINISHED_INTERVAL;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tonic::codec::CompressionEncoding;
use tonic::{
    transport::{Channel, Endpoint, Server, Uri},
    Request, Response, Status,
};
use tower::service_fn;
use tracing::{error, info, instrument, Instrument, Span};

/// REQUEST_TIMEOUT bounds unary calls between peers.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// DfdaemonUploadServer serves other peers' piece reads over TCP, the port
/// advertised as a parent's `upload_port` in the Scheduler's candidate list
/// (§4.6 step 5).
pub struct DfdaemonUploadServer {
    addr: SocketAddr,
    service: DfdaemonGRPCServer<DfdaemonServerHandler>,
    shutdown: shutdown::Shutdown,
    _shutdown_complete: mpsc::UnboundedSender<()>,
}

impl DfdaemonUploadServer {
    pub fn new(
        addr: SocketAddr,
        task: Arc<task::Task>,
        shutdown: shutdown::Shutdown,
        shutdown_complete_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let service = DfdaemonGRPCServer::new(DfdaemonServerHandler { task })
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(usize::MAX);

        Self {
            addr,
            service,
            shutdown,
            _shutdown_complete: shutdown_complete_tx,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self) {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(dragonfly_api::FILE_DESCRIPTOR_SET)
            .build()
            .unwrap();

        let mut shutdown = self.shutdown.clone();

        info!("upload server listening on {}", self.addr);
        Server::builder()
            .add_service(reflection.clone())
            .add_service(self.service.clone())
            .serve_with_shutdown(self.addr, async move {
                shutdown.recv().await;
                info!("upload grpc server shutting down");
            })
            .await
            .unwrap();
    }
}

/// DfdaemonDownloadServer serves this host's own CLI/SDK over a unix domain
/// socket, mirroring the teacher's local control-plane split.
pub struct DfdaemonDownloadServer {
    socket_path: PathBuf,
    service: DfdaemonGRPCServer<DfdaemonServerHandler>,
    shutdown: shutdown::Shutdown,
    _shutdown_complete: mpsc::UnboundedSender<()>,
}

impl DfdaemonDownloadServer {
    pub fn new(
        socket_path: PathBuf,
        task: Arc<task::Task>,
        shutdown: shutdown::Shutdown,
        shutdown_complete_tx: mpsc::UnboundedSender<()>,
    ) -> Self {
        let service = DfdaemonGRPCServer::new(DfdaemonServerHandler { task: task.clone() })
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(usize::MAX);

        Self {
            socket_path,
            service,
            shutdown,
            _shutdown_complete: shutdown_complete_tx,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self) {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(dragonfly_api::FILE_DESCRIPTOR_SET)
            .build()
            .unwrap();

        let mut shutdown = self.shutdown.clone();

        info!("download server listening on {}", self.socket_path.display());
        let uds = UnixListener::bind(&self.socket_path).unwrap();
        let uds_stream = UnixListenerStream::new(uds);
        Server::builder()
            .add_service(reflection.clone())
            .add_service(self.service.clone())
            .serve_with_incoming_shutdown(uds_stream, async move {
                shutdown.recv().await;
                info!("download grpc server shutting down");
            })
            .await
            .unwrap();

        std::fs::remove_file(&self.socket_path).unwrap();
        info!("remove the unix domain socket file of the download server");
    }
}

pub struct DfdaemonServerHandler {
    task: Arc<task::Task>,
}

#[tonic::async_trait]
impl Dfdaemon for DfdaemonServerHandler {
    type SyncPiecesStream = ReceiverStream<Result<SyncPiecesResponse, Status>>;

    /// sync_pieces streams the finished-ness of interested pieces back to a
    /// child peer, the parent side of §4.6 step 2.
    #[instrument(skip_all, fields(task_id))]
    async fn sync_pieces(
        &self,
        request: Request<SyncPiecesRequest>,
    ) -> Result<Response<Self::SyncPiecesStream>, Status> {
        let request = request.into_inner();
        let task_id = request.task_id;
        Span::current().record("task_id", task_id.clone());

        let mut interested_piece_numbers = request.interested_piece_numbers.clone();
        let task = self.task.clone();

        let (out_stream_tx, out_stream_rx) = mpsc::channel(128);
        tokio::spawn(
            async move {
                loop {
                    let mut has_started_piece = false;
                    let mut finished_piece_numbers = Vec::new();
                    for interested_piece_number in interested_piece_numbers.iter() {
                        let piece = match task.piece.get(task_id.as_str(), *interested_piece_number) {
                            Ok(Some(piece)) => piece,
                            Ok(None) => continue,
                            Err(err) => {
                                error!("get piece metadata: {}", err);
                                out_stream_tx
                                    .send(Err(Status::internal(err.to_string())))
                                    .await
                                    .unwrap_or_else(|err| {
                                        error!("send piece metadata to stream: {}", err);
                                    });
                                drop(out_stream_tx);
                                return;
                            }
                        };

                        if piece.is_finished() {
                            out_stream_tx
                                .send(Ok(SyncPiecesResponse {
                                    piece_number: piece.number,
                                }))
                                .await
                                .unwrap_or_else(|err| {
                                    error!("send finished piece to stream: {}", err);
                                });
                            finished_piece_numbers.push(piece.number);
                            continue;
                        }

                        if piece.is_started() {
                            has_started_piece = true;
                        }
                    }

                    interested_piece_numbers.retain(|number| !finished_piece_numbers.contains(number));

                    if interested_piece_numbers.is_empty() {
                        drop(out_stream_tx);
                        return;
                    }

                    if !has_started_piece {
                        drop(out_stream_tx);
                        return;
                    }

                    tokio::time::sleep(DEFAULT_WAIT_FOR_PIECE_FINISHED_INTERVAL).await;
                }
            }
            .in_current_span(),
        );

        Ok(Response::new(ReceiverStream::new(out_stream_rx)))
    }

    /// download_piece serves a finished piece's bytes to a child peer, the
    /// parent side of §4.6 step 5 (the transport the spec's informal
    /// "upload HTTP port" wording refers to is in fact this grpc call).
    #[instrument(skip_all, fields(task_id, piece_number))]
    async fn download_piece(
        &self,
        request: Request<DownloadPieceRequest>,
    ) -> Result<Response<DownloadPieceResponse>, Status> {
        let request = request.into_inner();
        let task = self.task.clone();
        let task_id = request.task_id;
        Span::current().record("task_id", task_id.as_str());
        let piece_number = request.piece_number;
        Span::current().record("piece_number", piece_number);

        let piece = task
            .piece
            .get(task_id.as_str(), piece_number)
            .map_err(|err| Status::internal(err.to_string()))?
            .ok_or_else(|| Status::not_found("piece metadata not found"))?;

        let mut reader = task
            .piece
            .download_from_local_peer_into_async_read(task_id.as_str(), piece_number)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;

        Ok(Response::new(DownloadPieceResponse {
            piece: Some(Piece {
                number: piece.number,
                parent_id: piece.parent_id,
                offset: piece.offset,
                length: piece.length,
                digest: piece.digest,
                content: Some(content),
                traffic_type: None,
                cost: None,
                created_at: None,
            }),
        }))
    }

    type DownloadTaskStream = ReceiverStream<Result<DownloadTaskResponse, Status>>;

    /// download_task is the client-facing entry point of a download, the
    /// local control-plane call a CLI/SDK makes over the unix socket. It
    /// registers with the scheduler and drives the Piece Synchronizer
    /// (§4.6) in the background, reporting terminal failure on the
    /// response stream. On-disk file assembly from finished pieces is out
    /// of scope; pieces land in the local `PieceStore` only.
    #[instrument(skip_all, fields(task_id, peer_id))]
    async fn download_task(
        &self,
        request: Request<DownloadTaskRequest>,
    ) -> Result<Response<Self::DownloadTaskStream>, Status> {
        let request = request.into_inner();
        let download = request
            .download
            .ok_or_else(|| Status::invalid_argument("missing download"))?;

        let task_id = self
            .task
            .id_generator
            .task_id(
                download.url.as_str(),
                download.digest.as_deref(),
                download.tag.as_deref(),
                download.application.as_deref(),
                download.piece_length,
                download.filters.clone(),
            )
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let peer_id = self.task.id_generator.peer_id(task_id.as_str());
        Span::current().record("task_id", task_id.as_str());
        Span::current().record("peer_id", peer_id.as_str());

        info!("download task started: {}", download.url);
        self.task
            .download_task_started(task_id.as_str(), download.piece_length)
            .map_err(|e| Status::internal(e.to_string()))?;

        let header: std::collections::HashMap<String, String> = download.header.clone();
        let content_length = self
            .task
            .get_content_length(task_id.as_str(), download.url.as_str(), header)
            .await
            .map_err(|e| {
                self.task
                    .download_task_failed(task_id.as_str())
                    .unwrap_or_else(|e| error!("download task failed: {}", e));
                Status::internal(e.to_string())
            })?;

        let piece_length = download.piece_length.unwrap_or(4 * 1024 * 1024);
        let piece_count = content_length.div_ceil(piece_length) as u32;
        let host_id = self.task.id_generator.host_id();

        let task = self.task.clone();
        let (out_stream_tx, out_stream_rx) = mpsc::channel(128);
        tokio::spawn(
            async move {
                drop(out_stream_tx);
                let result = task
                    .run(
                        task_id.as_str(),
                        peer_id.as_str(),
                        host_id.as_str(),
                        download.url.as_str(),
                        piece_length,
                        piece_count,
                        download.header.clone(),
                    )
                    .await;
                if let Err(err) = result {
                    error!("download task failed: {}", err);
                    task.download_task_failed(task_id.as_str())
                        .unwrap_or_else(|e| error!("download task failed: {}", e));
                }
            }
            .in_current_span(),
        );

        Ok(Response::new(ReceiverStream::new(out_stream_rx)))
    }

    #[instrument(skip_all)]
    async fn upload_task(&self, _request: Request<UploadTaskRequest>) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("not implemented"))
    }

    #[instrument(skip_all, fields(task_id))]
    async fn stat_task(
        &self,
        request: Request<StatTaskRequest>,
    ) -> Result<Response<dragonfly_api::common::v2::Task>, Status> {
        let request = request.into_inner();
        let task_id = request.task_id.clone();
        Span::current().record("task_id", task_id.as_str());

        let response = self
            .task
            .scheduler_client
            .stat_task(dragonfly_api::scheduler::v2::StatTaskRequest { id: task_id })
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(response))
    }

    #[instrument(skip_all)]
    async fn delete_task(&self, _request: Request<DeleteTaskRequest>) -> Result<Response<()>, Status> {
        Err(Status::unimplemented("not implemented"))
    }
}

/// DfdaemonClient is a wrapper of the generated dfdaemon grpc client, used
/// both by a child peer fetching pieces from a parent and by the local
/// CLI/SDK talking to this daemon's own unix socket.
#[derive(Clone)]
pub struct DfdaemonClient {
    pub client: DfdaemonGRPCClient<Channel>,
}

impl DfdaemonClient {
    pub async fn new(addr: String) -> ClientResult<Self> {
        let channel = Channel::from_shared(addr)
            .map_err(|e| dragonfly_client_core::error::invalid_argument(e.to_string()))?
            .connect()
            .await?;
        let client = DfdaemonGRPCClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(usize::MAX);
        Ok(Self { client })
    }

    pub async fn new_unix(socket_path: PathBuf) -> ClientResult<Self> {
        let channel = Endpoint::try_from("http://[::]:50051")
            .unwrap()
            .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(socket_path.clone())))
            .await?;
        let client = DfdaemonGRPCClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip)
            .max_decoding_message_size(usize::MAX);
        Ok(Self { client })
    }

    #[instrument(skip_all)]
    pub async fn sync_pieces(
        &self,
        request: SyncPiecesRequest,
    ) -> ClientResult<tonic::Response<tonic::codec::Streaming<SyncPiecesResponse>>> {
        let response = self.client.clone().sync_pieces(Request::new(request)).await?;
        Ok(response)
    }

    #[instrument(skip_all)]
    pub async fn download_piece(
        &self,
        request: DownloadPieceRequest,
        timeout: Duration,
    ) -> ClientResult<DownloadPieceResponse> {
        let mut request = Request::new(request);
        request.set_timeout(timeout);
        let response = self.client.clone().download_piece(request).await?;
        Ok(response.into_inner())
    }
}

/// GrpcParentClient adapts `DfdaemonClient` to the `ParentClient` interface
/// the Piece Synchronizer (§4.6) depends on, so the synchronizer's own code
/// never touches generated protobuf types.
pub struct GrpcParentClient {
    inner: DfdaemonClient,
    piece_download_timeout: Duration,
}

#[async_trait]
impl ParentClient for GrpcParentClient {
    async fn sync_pieces(
        &self,
        task_id: &str,
        interested_piece_numbers: Vec<u32>,
    ) -> ClientResult<std::pin::Pin<Box<dyn tokio_stream::Stream<Item = ClientResult<u32>> + Send>>> {
        let response = self
            .inner
            .sync_pieces(SyncPiecesRequest {
                task_id: task_id.to_string(),
                interested_piece_numbers,
            })
            .await?;

        let stream = response.into_inner();
        let mapped = tokio_stream::StreamExt::map(stream, |item| {
            item.map(|resp| resp.piece_number)
                .map_err(dragonfly_client_core::Error::from)
        });
        Ok(Box::pin(mapped))
    }

    async fn download_piece(&self, task_id: &str, piece_number: u32) -> ClientResult<DownloadedPiece> {
        let response = self
            .inner
            .download_piece(
                DownloadPieceRequest {
                    task_id: task_id.to_string(),
                    piece_number,
                },
                self.piece_download_timeout,
            )
            .await?;

        let piece = response
            .piece
            .ok_or_else(|| dragonfly_client_core::error::not_found("download_piece response missing piece"))?;
        let content = piece
            .content
            .ok_or_else(|| dragonfly_client_core::error::not_found("download_piece response missing content"))?;

        Ok(DownloadedPiece {
            offset: piece.offset,
            length: piece.length,
            digest: piece.digest,
            content,
        })
    }
}

/// GrpcParentClientFactory opens a fresh `DfdaemonClient` channel to a
/// candidate parent's advertised upload address on every connect, matching
/// the teacher's `DfdaemonClient::new(addr)` call pattern.
pub struct GrpcParentClientFactory {
    piece_download_timeout: Duration,
}

impl GrpcParentClientFactory {
    pub fn new(piece_download_timeout: Duration) -> Self {
        Self {
            piece_download_timeout,
        }
    }
}

#[async_trait]
impl ParentClientFactory for GrpcParentClientFactory {
    async fn connect(&self, parent: &Parent) -> ClientResult<Arc<dyn ParentClient>> {
        let addr = format!("http://{}:{}", parent.ip, parent.upload_port);
        let inner = DfdaemonClient::new(addr).await?;
        Ok(Arc::new(GrpcParentClient {
            inner,
            piece_download_timeout: self.piece_download_timeout,
        }))
    }
}
