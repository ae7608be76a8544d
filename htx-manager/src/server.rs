use clap::Parser;
use htx_manager::config::{make_config_loader, ManagerArgs, ManagerConfig};
use htx_manager::metrics;
use htx_manager::spawner::ProcessLauncher;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let args = ManagerArgs::parse();
    let mut config = make_config_loader()
        .load()
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
    args.apply(&mut config);

    init_tracing(&config)?;
    let _registry = metrics::register_all();

    info!(
        uid = %config.uid,
        block_id = ?config.block_id,
        task_url = %config.task_url,
        result_url = %config.result_url,
        cores_per_worker = config.cores_per_worker,
        heartbeat_period = ?config.heartbeat_period,
        heartbeat_threshold = ?config.heartbeat_threshold,
        poll_period = ?config.poll_period,
        mode = ?config.mode,
        container_image = ?config.container_image,
        "htx manager starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(htx_manager::run(config, Arc::new(ProcessLauncher)))?;

    info!("htx manager exiting");
    Ok(())
}

fn init_tracing(config: &ManagerConfig) -> anyhow::Result<()> {
    let default_directive = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &config.logdir {
        Some(logdir) => {
            let dir = logdir.join(&config.uid);
            std::fs::create_dir_all(&dir)?;
            let log_file = std::fs::File::create(dir.join("manager.log"))?;
            builder.with_writer(Arc::new(log_file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}
