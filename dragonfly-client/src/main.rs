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

use clap::Parser;
use dragonfly_client::grpc::{
    DfdaemonDownloadServer, DfdaemonUploadServer, GrpcParentClientFactory, SchedulerClient,
};
use dragonfly_client::shutdown::Shutdown;
use dragonfly_client::task::Task;
use dragonfly_client_backend::OriginBackend;
use dragonfly_client_config::dfdaemon::Config;
use dragonfly_client_storage::PieceStore;
use dragonfly_client_util::id_generator::IdGenerator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

/// Args are the dfdaemon command-line flags, mirroring the teacher's
/// clap-derived CLI for the dfdaemon binary.
#[derive(Debug, Parser)]
#[command(name = "dfdaemon", about = "dfdaemon of dragonfly p2p file distribution system")]
struct Args {
    /// config is the path to the dfdaemon configuration file.
    #[arg(short, long, default_value = "/etc/dragonfly/dfdaemon.yaml")]
    config: PathBuf,

    /// host-ip is this host's advertised IP, used to derive HostID/PeerID.
    #[arg(long, default_value = "127.0.0.1")]
    host_ip: String,

    /// hostname is this host's advertised hostname.
    #[arg(long, default_value_t = hostname())]
    hostname: String,

    /// upload-addr is the TCP address the upload grpc server binds to.
    #[arg(long, default_value = "0.0.0.0:4000")]
    upload_addr: SocketAddr,

    /// download-socket is the unix domain socket path the download grpc
    /// server binds to.
    #[arg(long, default_value = "/var/run/dfdaemon.sock")]
    download_socket: PathBuf,

    /// scheduler-addr is the scheduler's grpc address this dfdaemon
    /// announces peers to.
    #[arg(long, default_value = "http://127.0.0.1:8002")]
    scheduler_addr: String,
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let config = Config::load(&args.config).unwrap_or_default();

    let id_generator = Arc::new(IdGenerator::new(args.host_ip.clone(), args.hostname.clone()));
    let piece_store = Arc::new(PieceStore::new(config.storage.dir.clone()));
    let backend = Arc::new(OriginBackend::new());
    let scheduler_client = Arc::new(SchedulerClient::new(args.scheduler_addr.clone()).await?);
    let parent_factory = Arc::new(GrpcParentClientFactory::new(config.download.piece_download_timeout));

    let task = Arc::new(Task::new(
        id_generator,
        scheduler_client,
        piece_store,
        backend,
        config.download.clone(),
        parent_factory,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::unbounded_channel();

    let upload_server = DfdaemonUploadServer::new(
        args.upload_addr,
        task.clone(),
        Shutdown::new(shutdown_tx.subscribe()),
        shutdown_complete_tx.clone(),
    );
    let download_server = DfdaemonDownloadServer::new(
        args.download_socket.clone(),
        task.clone(),
        Shutdown::new(shutdown_tx.subscribe()),
        shutdown_complete_tx.clone(),
    );

    let upload_handle = tokio::spawn(async move { upload_server.run().await });
    let download_handle = tokio::spawn(async move { download_server.run().await });

    info!("dfdaemon started");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", err);
    }

    info!("dfdaemon shutting down");
    let _ = shutdown_tx.send(());
    drop(shutdown_complete_tx);
    let _ = tokio::join!(upload_handle, download_handle);
    let _ = shutdown_complete_rx.recv().await;

    Ok(())
}
