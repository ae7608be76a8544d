use clap::Parser;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How worker processes are launched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Plain child process on the host.
    NoContainer,
    /// Worker runs inside a singularity container that is reused for its
    /// whole lifetime.
    SingularityReuse,
    /// Worker runs inside a fresh singularity container and exits after a
    /// single task.
    SingularitySingleUse,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Interchange endpoint handing out tasks, `tcp://host:port`.
    pub task_url: String,
    /// Interchange endpoint collecting results, `tcp://host:port`.
    pub result_url: String,
    /// Identity this manager registers under.
    pub uid: String,
    /// Provisioning block this manager belongs to, if any.
    pub block_id: Option<String>,
    /// Cores per worker; values below 1.0 oversubscribe the node.
    pub cores_per_worker: f64,
    /// Hard cap on the worker pool, on top of the core-derived capacity.
    pub max_workers: usize,
    /// Task backlog the manager is willing to hold beyond one per worker
    /// slot.
    pub max_queue_size: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_period: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_threshold: Duration,
    /// Initial multiplexed poll timeout; also the floor of the idle
    /// backoff.
    #[serde(with = "humantime_serde")]
    pub poll_period: Duration,
    /// Loopback port range workers connect back on.
    pub worker_port_range: (u16, u16),
    pub mode: WorkerMode,
    pub container_image: Option<String>,
    /// Per-uid log directories are created under this root.
    pub logdir: Option<PathBuf>,
    pub debug: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            task_url: "tcp://127.0.0.1:50097".to_string(),
            result_url: "tcp://127.0.0.1:50098".to_string(),
            uid: "manager".to_string(),
            block_id: None,
            cores_per_worker: 1.0,
            max_workers: usize::MAX,
            max_queue_size: 10,
            heartbeat_period: Duration::from_secs(30),
            heartbeat_threshold: Duration::from_secs(120),
            poll_period: Duration::from_millis(10),
            worker_port_range: (50000, 60000),
            mode: WorkerMode::SingularityReuse,
            container_image: None,
            logdir: None,
            debug: false,
        }
    }
}

pub struct ConfigLoader {
    config_file: PathBuf,
}

impl ConfigLoader {
    pub fn new(config_file: PathBuf) -> Self {
        Self { config_file }
    }

    fn figment(&self) -> Figment {
        Figment::from(Serialized::defaults(ManagerConfig::default()))
            .merge(Toml::file(&self.config_file))
            .merge(Env::prefixed("HTX_MANAGER__").split("__"))
    }

    pub fn load(&self) -> Result<ManagerConfig, figment::Error> {
        self.figment().extract()
    }
}

pub fn make_config_loader() -> ConfigLoader {
    ConfigLoader::new(PathBuf::from("config/manager.toml"))
}

/// Command-line surface; every flag overrides the corresponding config
/// field.
#[derive(Debug, Parser)]
#[command(name = "htx-manager", version, about = "htx node manager")]
pub struct ManagerArgs {
    /// Endpoint for receiving tasks, tcp://host:port
    #[arg(short = 't', long)]
    pub task_url: Option<String>,
    /// Endpoint for posting results, tcp://host:port
    #[arg(short = 'r', long)]
    pub result_url: Option<String>,
    /// Unique identifier string for this manager
    #[arg(short, long)]
    pub uid: Option<String>,
    /// Block identifier string for this manager
    #[arg(short, long)]
    pub block_id: Option<String>,
    /// Cores assigned to each worker
    #[arg(short, long)]
    pub cores_per_worker: Option<f64>,
    /// Cap on the number of workers that can be launched
    #[arg(long)]
    pub max_workers: Option<usize>,
    /// Heartbeat period in seconds
    #[arg(long)]
    pub hb_period: Option<u64>,
    /// Heartbeat threshold in seconds
    #[arg(long)]
    pub hb_threshold: Option<u64>,
    /// Poll period in milliseconds
    #[arg(long)]
    pub poll: Option<u64>,
    /// Worker launch mode
    #[arg(long)]
    pub mode: Option<WorkerMode>,
    /// Container image identifier or path
    #[arg(long)]
    pub container_image: Option<String>,
    /// Worker pool log directory
    #[arg(short, long)]
    pub logdir: Option<PathBuf>,
    #[arg(short, long)]
    pub debug: bool,
}

impl ManagerArgs {
    pub fn apply(self, config: &mut ManagerConfig) {
        if let Some(task_url) = self.task_url {
            config.task_url = task_url;
        }
        if let Some(result_url) = self.result_url {
            config.result_url = result_url;
        }
        if let Some(uid) = self.uid {
            config.uid = uid;
        } else if config.uid == ManagerConfig::default().uid {
            // Nothing named this manager, neither flag nor config file.
            config.uid = random_uid();
        }
        if let Some(block_id) = self.block_id {
            config.block_id = Some(block_id);
        }
        if let Some(cores_per_worker) = self.cores_per_worker {
            config.cores_per_worker = cores_per_worker;
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(secs) = self.hb_period {
            config.heartbeat_period = Duration::from_secs(secs);
        }
        if let Some(secs) = self.hb_threshold {
            config.heartbeat_threshold = Duration::from_secs(secs);
        }
        if let Some(millis) = self.poll {
            config.poll_period = Duration::from_millis(millis);
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(container_image) = self.container_image {
            config.container_image = Some(container_image);
        }
        if let Some(logdir) = self.logdir {
            config.logdir = Some(logdir);
        }
        if self.debug {
            config.debug = true;
        }
    }
}

/// Short random identity, used when neither `--uid` nor the config file
/// names the manager.
fn random_uid() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    id.rsplit('-').next().unwrap_or("manager").to_string()
}
