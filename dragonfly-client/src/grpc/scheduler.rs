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

use dragonfly_api::scheduler::v2::{
    scheduler_client::SchedulerClient as SchedulerGRPCClient, AnnouncePeerRequest,
    AnnouncePeerResponse, DeleteHostRequest, DeleteTaskRequest, LeavePeerRequest,
    StatPeerRequest, StatTaskRequest,
};
use dragonfly_client_core::Result;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tracing::instrument;

/// REQUEST_TIMEOUT bounds unary calls to the scheduler, mirroring the
/// teacher's `super::REQUEST_TIMEOUT` constant used by every grpc client in
/// this crate.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// SchedulerClient is a wrapper of the generated scheduler grpc client,
/// giving every dfdaemon task a single long-lived `AnnouncePeer` duplex
/// stream to send requests on and read responses off (§4.4, §4.6).
#[derive(Clone)]
pub struct SchedulerClient {
    client: SchedulerGRPCClient<Channel>,
}

impl SchedulerClient {
    pub async fn new(addr: String) -> Result<Self> {
        let channel = Channel::from_shared(addr)
            .map_err(|e| dragonfly_client_core::error::invalid_argument(e.to_string()))?
            .connect()
            .await?;
        Ok(Self {
            client: SchedulerGRPCClient::new(channel),
        })
    }

    /// announce_peer opens the duplex stream used by one download task for
    /// its entire lifetime: `out_rx` is fed register/reschedule/piece
    /// finished/failed requests, and the returned stream yields the
    /// scheduler's responses.
    #[instrument(skip_all)]
    pub async fn announce_peer(
        &self,
        out_rx: mpsc::Receiver<AnnouncePeerRequest>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<AnnouncePeerResponse>>> {
        let request = tonic::Request::new(ReceiverStream::new(out_rx));
        let response = self.client.clone().announce_peer(request).await?;
        Ok(response)
    }

    #[instrument(skip_all)]
    pub async fn stat_peer(
        &self,
        request: StatPeerRequest,
    ) -> Result<dragonfly_api::common::v2::Peer> {
        let mut request = tonic::Request::new(request);
        request.set_timeout(REQUEST_TIMEOUT);
        let response = self.client.clone().stat_peer(request).await?;
        Ok(response.into_inner())
    }

    #[instrument(skip_all)]
    pub async fn leave_peer(&self, request: LeavePeerRequest) -> Result<()> {
        let mut request = tonic::Request::new(request);
        request.set_timeout(REQUEST_TIMEOUT);
        self.client.clone().leave_peer(request).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn stat_task(
        &self,
        request: StatTaskRequest,
    ) -> Result<dragonfly_api::common::v2::Task> {
        let mut request = tonic::Request::new(request);
        request.set_timeout(REQUEST_TIMEOUT);
        let response = self.client.clone().stat_task(request).await?;
        Ok(response.into_inner())
    }

    #[instrument(skip_all)]
    pub async fn delete_task(&self, request: DeleteTaskRequest) -> Result<()> {
        let mut request = tonic::Request::new(request);
        request.set_timeout(REQUEST_TIMEOUT);
        self.client.clone().delete_task(request).await?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn delete_host(&self, request: DeleteHostRequest) -> Result<()> {
        let mut request = tonic::Request::new(request);
        request.set_timeout(REQUEST_TIMEOUT);
        self.client.clone().delete_host(request).await?;
        Ok(())
    }
}
