use crate::config::ManagerConfig;
use crate::dispatch::Dispatcher;
use crate::error::ManagerError;
use crate::net::router::WorkerRouter;
use crate::net::uplink::{ResultUplink, TaskUplink};
use crate::pusher::ResultPusher;
use crate::spawner::WorkerLauncher;
use crate::worker_map::{LaunchTemplate, WorkerMap};
use htx_protocol::Registration;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod config;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod model;
pub mod net;
pub mod pusher;
pub mod scheduler;
pub mod spawner;
pub mod worker_map;

#[cfg(test)]
test_r::enable!();

const WORKER_ADDRESS: &str = "127.0.0.1";

/// Connects both uplinks, binds the worker router, and runs the dispatch
/// loop and the result pusher to completion. Returns `Ok` on a clean STOP
/// and `Err(InterchangeLost)` when the interchange goes silent.
pub async fn run(
    config: ManagerConfig,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<(), ManagerError> {
    let cores = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1);
    let available_mem_gib = available_memory_gib();
    let capacity = config
        .max_workers
        .min((cores as f64 / config.cores_per_worker).floor() as usize);
    if capacity == 0 {
        return Err(ManagerError::Config(format!(
            "capacity is zero: {cores} cores at {} cores per worker, max_workers {}",
            config.cores_per_worker, config.max_workers
        )));
    }
    info!(
        uid = %config.uid,
        cores,
        available_mem_gib,
        capacity,
        "manager starting"
    );

    let uplink = TaskUplink::connect(&config.task_url, &config.uid).await?;
    let results_uplink = ResultUplink::connect(&config.result_url, &config.uid).await?;
    let router = WorkerRouter::bind(WORKER_ADDRESS, config.worker_port_range).await?;

    let template = LaunchTemplate {
        address: WORKER_ADDRESS.to_string(),
        port: router.port,
        uid: config.uid.clone(),
        logdir: config.logdir.clone(),
        debug: config.debug,
        mode: config.mode,
        container_image: config.container_image.clone(),
    };
    let worker_map = WorkerMap::new(capacity, launcher, template);

    let registration = Registration {
        protocol_version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_version: "rust".to_string(),
        worker_count: capacity,
        cores,
        mem: available_mem_gib,
        block_id: config.block_id.clone(),
        os: std::env::consts::OS.to_string(),
        hname: gethostname::gethostname().to_string_lossy().to_string(),
        dir: std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
    };

    let shutdown = CancellationToken::new();
    let (results_tx, results_rx) = mpsc::unbounded_channel();

    let pusher = ResultPusher::new(
        results_uplink,
        results_rx,
        config.max_queue_size + capacity,
        config.poll_period,
        shutdown.clone(),
    );
    let dispatcher = Dispatcher::new(
        &config,
        uplink,
        router,
        worker_map,
        results_tx,
        registration,
        shutdown.clone(),
    );

    let mut join_set: JoinSet<Result<(), ManagerError>> = JoinSet::new();
    join_set.spawn(pusher.run());
    join_set.spawn(dispatcher.run());

    let mut outcome = Ok(());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("manager loop failed: {e}");
                shutdown.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
            Err(e) => {
                error!("manager loop panicked: {e}");
                shutdown.cancel();
                if outcome.is_ok() {
                    outcome = Err(ManagerError::Internal(e.to_string()));
                }
            }
        }
    }
    outcome
}

/// Available memory in GiB, rounded to one decimal.
fn available_memory_gib() -> f64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let gib = system.available_memory() as f64 / (1u64 << 30) as f64;
    (gib * 10.0).round() / 10.0
}
