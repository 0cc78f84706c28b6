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
use chrono::Duration as ChronoDuration;
use dragonfly_scheduler::grpc::SchedulerGrpcServer;
use dragonfly_scheduler::networktopology::{CachedNetworkTopology, InMemoryKeyValueStore, NetworkTopology};
use dragonfly_scheduler::resource::{HostManager, TaskManager};
use dragonfly_scheduler::service::{Evaluator, GrpcSeedTrigger, SchedulerCore};
use dragonfly_scheduler::shutdown::Shutdown;
use dragonfly_client_backend::OriginBackend;
use dragonfly_client_config::scheduler::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Args are the scheduler command-line flags, mirroring the client binary's
/// clap-derived CLI.
#[derive(Debug, Parser)]
#[command(name = "scheduler", about = "Scheduler of dragonfly p2p file distribution system")]
struct Args {
    #[arg(short, long, default_value = "/etc/dragonfly/scheduler.yaml")]
    config: PathBuf,

    #[arg(long, default_value = "0.0.0.0:8002")]
    addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let config = Config::load(&args.config).unwrap_or_default();

    let tasks = Arc::new(TaskManager::new());
    let hosts = Arc::new(HostManager::new());
    let evaluator = Evaluator::new(config.evaluator_weights);
    let cached_topology = Arc::new(CachedNetworkTopology::new());
    let kv = Arc::new(InMemoryKeyValueStore::new());
    let probe_topology = Arc::new(NetworkTopology::new(kv, config.network_topology.probe_queue_length));
    let seed_trigger = Arc::new(GrpcSeedTrigger);
    let backend = Arc::new(OriginBackend::new());

    let core = Arc::new(SchedulerCore::new(
        tasks.clone(),
        hosts.clone(),
        evaluator,
        cached_topology.clone(),
        seed_trigger,
        config.scheduler.clone(),
        backend,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    let grpc_server = SchedulerGrpcServer::new(args.addr, core.clone(), probe_topology.clone());
    let grpc_shutdown = Shutdown::new(shutdown_tx.subscribe());
    let grpc_handle = tokio::spawn(async move { grpc_server.run(grpc_shutdown).await });

    spawn_gc_loop(
        "peer",
        config.scheduler.peer_gc_interval,
        Shutdown::new(shutdown_tx.subscribe()),
        {
            let tasks = tasks.clone();
            let ttl = ChronoDuration::from_std(config.scheduler.peer_ttl).unwrap_or_default();
            move || {
                let expired = tasks.sweep_expired_peers(ttl);
                if !expired.is_empty() {
                    info!(count = expired.len(), "swept expired peers");
                }
            }
        },
    );

    spawn_gc_loop(
        "task",
        config.scheduler.task_gc_interval,
        Shutdown::new(shutdown_tx.subscribe()),
        {
            let tasks = tasks.clone();
            let ttl = ChronoDuration::from_std(config.scheduler.task_ttl).unwrap_or_default();
            move || {
                let expired = tasks.sweep_expired(ttl);
                if !expired.is_empty() {
                    info!(count = expired.len(), "swept expired tasks");
                }
            }
        },
    );

    spawn_gc_loop(
        "host",
        config.scheduler.host_gc_interval,
        Shutdown::new(shutdown_tx.subscribe()),
        {
            let hosts = hosts.clone();
            let ttl = ChronoDuration::from_std(config.scheduler.host_ttl).unwrap_or_default();
            move || {
                let expired = hosts.sweep_expired(ttl);
                if !expired.is_empty() {
                    info!(count = expired.len(), "swept expired hosts");
                }
            }
        },
    );

    spawn_probe_collect_loop(
        config.network_topology.collect_interval,
        Shutdown::new(shutdown_tx.subscribe()),
        hosts.clone(),
        probe_topology.clone(),
        cached_topology.clone(),
    );

    info!("scheduler started on {}", args.addr);
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", err);
    }

    info!("scheduler shutting down");
    let _ = shutdown_tx.send(());
    let _ = grpc_handle.await;

    Ok(())
}

/// spawn_gc_loop drives one of the three TTL sweepers of §4.9 on its own
/// interval, stopping as soon as the shutdown signal fires.
fn spawn_gc_loop<F>(name: &'static str, interval: std::time::Duration, mut shutdown: Shutdown, mut sweep: F)
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => sweep(),
                _ = shutdown.recv() => {
                    info!("{} gc loop shutting down", name);
                    return;
                }
            }
        }
    });
}

/// spawn_probe_collect_loop bridges the async `NetworkTopology` probe store
/// to the sync `CachedNetworkTopology` the Evaluator reads from (§4.8,
/// `networkTopology.collectInterval`): every tick it walks the live host set
/// and copies each ordered pair's last computed `AverageRTT` into the cache,
/// so Evaluator scoring never awaits key-value I/O.
fn spawn_probe_collect_loop(
    interval: std::time::Duration,
    mut shutdown: Shutdown,
    hosts: Arc<HostManager>,
    probe_topology: Arc<NetworkTopology>,
    cached_topology: Arc<CachedNetworkTopology>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = hosts.snapshot();
                    for src in &snapshot {
                        for dst in &snapshot {
                            if src.id == dst.id {
                                continue;
                            }
                            if let Some(rtt) = probe_topology.average_rtt(&src.id, &dst.id).await {
                                cached_topology.refresh(&src.id, &dst.id, rtt);
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("network topology collect loop shutting down");
                    return;
                }
            }
        }
    });
}
