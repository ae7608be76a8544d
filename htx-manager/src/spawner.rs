use crate::config::WorkerMode;
use htx_protocol::{TaskType, WorkerId};
use std::io;
use std::path::PathBuf;
use tokio::process::{Child, Command};
use tracing::debug;

/// Everything needed to launch one worker process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub worker_id: WorkerId,
    pub worker_type: TaskType,
    pub address: String,
    pub port: u16,
    pub uid: String,
    pub logdir: Option<PathBuf>,
    pub debug: bool,
    pub mode: WorkerMode,
    pub container_image: Option<String>,
}

/// Handle on a launched worker. The manager never reaps the child; death
/// is observed through the downlink (WRKR_DIE or a closed connection).
pub struct WorkerHandle {
    pub child: Option<Child>,
}

impl WorkerHandle {
    pub fn detached() -> Self {
        Self { child: None }
    }
}

/// Seam between the worker map and process creation. The production
/// implementation shells out; tests substitute a recorder.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<WorkerHandle>;
}

/// Launches `htx-worker` processes, optionally wrapped in a singularity
/// container per the configured mode.
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<WorkerHandle> {
        let mut command = match spec.mode {
            WorkerMode::NoContainer => Command::new("htx-worker"),
            WorkerMode::SingularityReuse | WorkerMode::SingularitySingleUse => {
                let image = spec.container_image.as_deref().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "container mode requires a container image",
                    )
                })?;
                let mut command = Command::new("singularity");
                command.arg("exec").arg(image).arg("htx-worker");
                if spec.mode == WorkerMode::SingularitySingleUse {
                    command.arg("--single-task");
                }
                command
            }
        };

        command
            .arg("--id")
            .arg(spec.worker_id.as_str())
            .arg("--type")
            .arg(spec.worker_type.as_str())
            .arg("--address")
            .arg(&spec.address)
            .arg("--port")
            .arg(spec.port.to_string())
            .arg("--uid")
            .arg(&spec.uid);
        if let Some(logdir) = &spec.logdir {
            command.arg("--logdir").arg(logdir);
        }
        if spec.debug {
            command.arg("--debug");
        }

        debug!(
            worker_id = %spec.worker_id,
            worker_type = %spec.worker_type,
            "launching worker: {command:?}"
        );
        let child = command.spawn()?;
        Ok(WorkerHandle { child: Some(child) })
    }
}
