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

use crate::resource::{Host, HostType};
use async_trait::async_trait;
use dragonfly_api::common::v2::Download;
use dragonfly_api::dfdaemon::v2::{dfdaemon_client::DfdaemonClient, DownloadTaskRequest};
use dragonfly_client_core::Result as ClientResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tonic::transport::Endpoint;
use tracing::warn;

/// SeedPiece is one progress update a seed host reports while back-sourcing
/// from origin on behalf of the swarm (§4.7, §9 "WatchSeedProgress").
#[derive(Debug, Clone)]
pub struct SeedPiece {
    pub task_id: String,
    pub piece_number: u32,
    pub finished: bool,
}

/// SeedProgressWatch is a bounded multi-producer/single-consumer channel of
/// `SeedPiece` updates. The source project's `SeedProgressManager` leaves
/// the slow-consumer behavior ambiguous (§9 Open Question); we resolve it
/// as bounded-buffer with drop-oldest-and-log, so a slow watcher can never
/// make the seed's upload loop block or unbounded-buffer memory.
pub struct SeedProgressWatch {
    capacity: usize,
    buffer: Mutex<VecDeque<SeedPiece>>,
    notify: Notify,
}

impl SeedProgressWatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// publish appends a progress update, dropping the oldest buffered one
    /// (and logging it) if the channel is already at capacity.
    pub fn publish(&self, piece: SeedPiece) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            if let Some(dropped) = buffer.pop_front() {
                warn!(
                    task_id = %dropped.task_id,
                    piece_number = dropped.piece_number,
                    "seed progress watcher too slow, dropping oldest update"
                );
            }
        }
        buffer.push_back(piece);
        drop(buffer);
        self.notify.notify_waiters();
    }

    /// next awaits and returns the oldest buffered update.
    pub async fn next(&self) -> SeedPiece {
        loop {
            if let Some(piece) = self.buffer.lock().pop_front() {
                return piece;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// SeedTrigger issues the out-of-band `TriggerDownloadTask` RPC to a seed
/// host (§4.7). The gRPC boundary layer provides the real implementation;
/// `NoopSeedTrigger` is used where no seed transport is wired (tests, or a
/// deployment with seed peers disabled).
#[async_trait]
pub trait SeedTrigger: Send + Sync {
    async fn trigger_download_task(
        &self,
        seed_host: &Host,
        task_id: &str,
        url: &str,
    ) -> dragonfly_client_core::Result<()>;
}

pub struct NoopSeedTrigger;

#[async_trait]
impl SeedTrigger for NoopSeedTrigger {
    async fn trigger_download_task(
        &self,
        _seed_host: &Host,
        _task_id: &str,
        _url: &str,
    ) -> dragonfly_client_core::Result<()> {
        Err(dragonfly_client_core::error::not_found(
            "no seed transport configured",
        ))
    }
}

/// GrpcSeedTrigger issues `TriggerDownloadTask` against the seed host's own
/// dfdaemon upload-port endpoint (§4.7): the same `Dfdaemon.DownloadTask`
/// RPC a local CLI/SDK uses to start a download, reached over TCP instead
/// of the unix socket. The seed host then becomes a peer of the task like
/// any other, driving its own Piece Synchronizer back to origin.
pub struct GrpcSeedTrigger;

#[async_trait]
impl SeedTrigger for GrpcSeedTrigger {
    async fn trigger_download_task(&self, seed_host: &Host, task_id: &str, url: &str) -> ClientResult<()> {
        let addr = format!("http://{}:{}", seed_host.ip, seed_host.port);
        let channel = Endpoint::from_shared(addr)?.connect().await?;
        let mut client = DfdaemonClient::new(channel);

        let mut stream = client
            .download_task(DownloadTaskRequest {
                download: Some(Download {
                    url: url.to_string(),
                    ..Default::default()
                }),
            })
            .await?
            .into_inner();

        // The seed's own synchronizer runs once this call returns its first
        // response; we do not block on the whole download, only on the
        // handshake that confirms the seed accepted the task.
        stream.next().await.transpose()?;
        let _ = task_id;
        Ok(())
    }
}

/// select_seed_host picks the best affinity-ranked seed host out of
/// `hosts` for `task`, restricted to seed-type hosts with a free upload
/// slot (§4.7 "selects a seed host (by affinity via Evaluator restricted to
/// seed hosts)"). Affinity here reduces to upload-success-rate, since
/// location/RTT terms need a concrete child host which does not exist yet
/// when a task has no peers.
pub fn select_seed_host(hosts: &[Arc<Host>]) -> Option<Arc<Host>> {
    hosts
        .iter()
        .filter(|h| h.host_type.is_seed() && h.has_free_upload_slot())
        .max_by(|a, b| {
            a.upload_success_rate()
                .partial_cmp(&b.upload_success_rate())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_host(id: &str) -> Arc<Host> {
        Arc::new(Host::new(
            id.into(),
            "10.0.0.1".into(),
            "seed".into(),
            8080,
            8081,
            HostType::SuperSeed,
            10,
        ))
    }

    #[test]
    fn select_seed_host_ignores_normal_hosts() {
        let normal = Arc::new(Host::new(
            "h1".into(),
            "10.0.0.2".into(),
            "normal".into(),
            8080,
            8081,
            HostType::Normal,
            10,
        ));
        let seed = seed_host("h2");
        let picked = select_seed_host(&[normal, seed.clone()]).unwrap();
        assert_eq!(picked.id, seed.id);
    }

    #[test]
    fn select_seed_host_excludes_full_hosts() {
        let seed = seed_host("h1");
        for _ in 0..10 {
            assert!(seed.acquire_upload_slot());
        }
        assert!(select_seed_host(&[seed]).is_none());
    }

    #[tokio::test]
    async fn seed_progress_watch_drops_oldest_when_full() {
        let watch = SeedProgressWatch::new(2);
        watch.publish(SeedPiece { task_id: "t1".into(), piece_number: 0, finished: false });
        watch.publish(SeedPiece { task_id: "t1".into(), piece_number: 1, finished: false });
        watch.publish(SeedPiece { task_id: "t1".into(), piece_number: 2, finished: false });

        assert_eq!(watch.len(), 2);
        let first = watch.next().await;
        assert_eq!(first.piece_number, 1, "piece 0 should have been dropped as oldest");
    }

    #[tokio::test]
    async fn seed_progress_watch_next_awaits_publish() {
        let watch = Arc::new(SeedProgressWatch::new(4));
        let watch2 = watch.clone();
        let handle = tokio::spawn(async move { watch2.next().await });
        tokio::task::yield_now().await;
        watch.publish(SeedPiece { task_id: "t1".into(), piece_number: 0, finished: true });
        let piece = handle.await.unwrap();
        assert!(piece.finished);
    }
}
