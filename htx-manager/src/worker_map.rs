use crate::config::WorkerMode;
use crate::error::ManagerError;
use crate::metrics;
use crate::model::WorkerState;
use crate::spawner::{LaunchSpec, WorkerHandle, WorkerLauncher};
use htx_protocol::{TaskType, WorkerId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// After this many consecutive launch failures for a type, spin-ups of
/// that type are suspended until a task of the type arrives again.
pub const MAX_CONSECUTIVE_SPAWN_FAILURES: u32 = 5;

/// The per-node launch parameters shared by every worker; combined with a
/// worker id and type this yields a [`LaunchSpec`].
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub address: String,
    pub port: u16,
    pub uid: String,
    pub logdir: Option<PathBuf>,
    pub debug: bool,
    pub mode: WorkerMode,
    pub container_image: Option<String>,
}

impl LaunchTemplate {
    fn spec(&self, worker_id: &WorkerId, worker_type: &TaskType) -> LaunchSpec {
        LaunchSpec {
            worker_id: worker_id.clone(),
            worker_type: worker_type.clone(),
            address: self.address.clone(),
            port: self.port,
            uid: self.uid.clone(),
            logdir: self.logdir.clone(),
            debug: self.debug,
            mode: self.mode,
            container_image: self.container_image.clone(),
        }
    }
}

struct Worker {
    task_type: TaskType,
    state: WorkerState,
    _handle: WorkerHandle,
}

/// Authoritative state of the worker pool: identities, lifecycle, per-type
/// totals, idle FIFOs and outstanding drain requests. Mutated only from
/// the dispatch loop.
pub struct WorkerMap {
    capacity: usize,
    launcher: Arc<dyn WorkerLauncher>,
    template: LaunchTemplate,
    workers: HashMap<WorkerId, Worker>,
    idle_queues: BTreeMap<TaskType, VecDeque<WorkerId>>,
    total_by_type: BTreeMap<TaskType, usize>,
    to_die: BTreeMap<TaskType, usize>,
    pending: usize,
    active: usize,
    counter: u64,
    spawn_failures: HashMap<TaskType, u32>,
}

impl WorkerMap {
    pub fn new(capacity: usize, launcher: Arc<dyn WorkerLauncher>, template: LaunchTemplate) -> Self {
        Self {
            capacity,
            launcher,
            template,
            workers: HashMap::new(),
            idle_queues: BTreeMap::new(),
            total_by_type: BTreeMap::new(),
            to_die: BTreeMap::new(),
            pending: 0,
            active: 0,
            counter: 0,
            spawn_failures: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_workers(&self) -> usize {
        self.total_by_type.values().sum()
    }

    pub fn total_by_type(&self) -> &BTreeMap<TaskType, usize> {
        &self.total_by_type
    }

    pub fn to_die(&self) -> &BTreeMap<TaskType, usize> {
        &self.to_die
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn active(&self) -> usize {
        self.active
    }

    /// Workers idle across all types; doubles as the capacity request the
    /// manager advertises to the interchange.
    pub fn ready_worker_count(&self) -> usize {
        self.idle_queues.values().map(VecDeque::len).sum()
    }

    pub fn idle_count(&self, task_type: &TaskType) -> usize {
        self.idle_queues.get(task_type).map_or(0, VecDeque::len)
    }

    pub fn state_of(&self, worker_id: &WorkerId) -> Option<WorkerState> {
        self.workers.get(worker_id).map(|w| w.state)
    }

    /// Launches one worker of the given type. The new worker is PENDING
    /// until its REGISTER frame arrives on the downlink.
    pub fn add_worker(&mut self, worker_type: TaskType) -> Result<WorkerId, ManagerError> {
        let worker_id = WorkerId::new(self.counter.to_string());
        self.counter += 1;

        let spec = self.template.spec(&worker_id, &worker_type);
        match self.launcher.launch(&spec) {
            Ok(handle) => {
                self.workers.insert(
                    worker_id.clone(),
                    Worker {
                        task_type: worker_type.clone(),
                        state: WorkerState::Pending,
                        _handle: handle,
                    },
                );
                self.pending += 1;
                *self.total_by_type.entry(worker_type.clone()).or_insert(0) += 1;
                self.idle_queues.entry(worker_type.clone()).or_default();
                self.spawn_failures.remove(&worker_type);
                metrics::WORKERS_SPAWNED_TOTAL
                    .with_label_values(&[worker_type.as_str()])
                    .inc();
                debug!(%worker_id, %worker_type, "worker launched");
                Ok(worker_id)
            }
            Err(e) => {
                let failures = self.spawn_failures.entry(worker_type.clone()).or_insert(0);
                *failures += 1;
                let failures = *failures;
                warn!(%worker_type, failures, "worker launch failed: {e}");
                Err(ManagerError::Spawn(e.to_string()))
            }
        }
    }

    /// PENDING -> ACTIVE on a REGISTER frame. Stale ids are ignored.
    pub fn register(&mut self, worker_id: &WorkerId, reported_type: TaskType) {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            debug!(%worker_id, "REGISTER from unknown worker, ignoring");
            return;
        };
        if worker.state != WorkerState::Pending {
            warn!(%worker_id, state = ?worker.state, "duplicate REGISTER, ignoring");
            return;
        }
        if worker.task_type != reported_type {
            // The type is fixed at spawn; a disagreeing worker is a bug on
            // its side but the spawn-time type keeps the counters sound.
            warn!(
                %worker_id,
                spawned = %worker.task_type,
                reported = %reported_type,
                "worker registered with a different type than it was spawned for"
            );
        }
        worker.state = WorkerState::Active;
        let task_type = worker.task_type.clone();
        self.pending = self.pending.saturating_sub(1);
        self.active += 1;
        self.push_idle(&task_type, worker_id.clone());
        debug!(%worker_id, %task_type, "worker registered");
    }

    /// Returns an ACTIVE worker to its idle queue after it produced a
    /// result.
    pub fn put_worker(&mut self, worker_id: &WorkerId) {
        let Some(worker) = self.workers.get(worker_id) else {
            debug!(%worker_id, "result from unknown worker, not re-queueing");
            return;
        };
        if worker.state != WorkerState::Active {
            debug!(%worker_id, state = ?worker.state, "not re-queueing worker");
            return;
        }
        let task_type = worker.task_type.clone();
        if self
            .idle_queues
            .get(&task_type)
            .is_some_and(|q| q.contains(worker_id))
        {
            warn!(%worker_id, "worker already idle, not queueing twice");
            return;
        }
        self.push_idle(&task_type, worker_id.clone());
    }

    /// Pops the longest-idle worker of the given type.
    pub fn get_worker(&mut self, task_type: &TaskType) -> Option<WorkerId> {
        let worker_id = self.idle_queues.get_mut(task_type)?.pop_front()?;
        metrics::IDLE_WORKERS.dec();
        Some(worker_id)
    }

    /// Marks the worker that was just handed a KILL sentinel; it will exit
    /// after processing it.
    pub fn mark_draining(&mut self, worker_id: &WorkerId) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.state == WorkerState::Active {
                worker.state = WorkerState::Draining;
                self.active = self.active.saturating_sub(1);
            }
        }
    }

    /// Forgets a dead worker and fixes up every count it was part of.
    pub fn remove_worker(&mut self, worker_id: &WorkerId) {
        let Some(worker) = self.workers.remove(worker_id) else {
            debug!(%worker_id, "removal of unknown worker, ignoring");
            return;
        };
        let task_type = worker.task_type;
        if let Some(total) = self.total_by_type.get_mut(&task_type) {
            *total = total.saturating_sub(1);
        }
        match worker.state {
            WorkerState::Pending => self.pending = self.pending.saturating_sub(1),
            WorkerState::Active => self.active = self.active.saturating_sub(1),
            WorkerState::Draining => {
                let outstanding = self.to_die.entry(task_type.clone()).or_insert(0);
                *outstanding = outstanding.saturating_sub(1);
            }
        }
        if let Some(queue) = self.idle_queues.get_mut(&task_type) {
            if let Some(position) = queue.iter().position(|id| id == worker_id) {
                queue.remove(position);
                metrics::IDLE_WORKERS.dec();
            }
        }
        metrics::WORKERS_REMOVED_TOTAL
            .with_label_values(&[task_type.as_str()])
            .inc();
        debug!(%worker_id, %task_type, "worker removed");
    }

    /// Records one more outstanding drain request for the type; the caller
    /// pushes the matching KILL sentinel onto the task queue.
    pub fn request_drain(&mut self, task_type: &TaskType) {
        *self.to_die.entry(task_type.clone()).or_insert(0) += 1;
    }

    /// Re-arms spin-ups for a type that was suspended after repeated
    /// launch failures.
    pub fn note_task_seen(&mut self, task_type: &TaskType) {
        self.spawn_failures.remove(task_type);
    }

    /// Launches workers per the ordered plan, bounded by capacity and the
    /// per-type launch-failure gate. Returns the number spun up.
    pub fn spin_up_workers(&mut self, plan: &mut Vec<TaskType>) -> usize {
        let mut spun_up = 0;
        for worker_type in plan.drain(..) {
            if self.total_workers() >= self.capacity {
                debug!("worker pool at capacity, dropping the rest of the spin-up plan");
                break;
            }
            if self
                .spawn_failures
                .get(&worker_type)
                .is_some_and(|failures| *failures >= MAX_CONSECUTIVE_SPAWN_FAILURES)
            {
                debug!(%worker_type, "spin-up suspended after repeated launch failures");
                continue;
            }
            if self.add_worker(worker_type).is_ok() {
                spun_up += 1;
            }
        }
        spun_up
    }

    /// Types whose live (non-draining) worker count exceeds the target,
    /// with the excess per type.
    pub fn spin_down_workers(
        &self,
        target: &BTreeMap<TaskType, usize>,
    ) -> BTreeMap<TaskType, usize> {
        let mut spin_downs = BTreeMap::new();
        for (task_type, total) in &self.total_by_type {
            let draining = self.to_die.get(task_type).copied().unwrap_or(0);
            let live = total.saturating_sub(draining);
            let wanted = target.get(task_type).copied().unwrap_or(0);
            if live > wanted {
                spin_downs.insert(task_type.clone(), live - wanted);
            }
        }
        spin_downs
    }

    /// Ordered spin-up plan: one entry per missing worker, for every type
    /// whose target exceeds its current total. Draining workers still
    /// count toward the total so replacements wait for the slot to free.
    pub fn get_next_worker_q(&self, target: &BTreeMap<TaskType, usize>) -> Vec<TaskType> {
        let mut plan = Vec::new();
        for (task_type, wanted) in target {
            let have = self.total_by_type.get(task_type).copied().unwrap_or(0);
            for _ in have..*wanted {
                plan.push(task_type.clone());
            }
        }
        plan
    }

    fn push_idle(&mut self, task_type: &TaskType, worker_id: WorkerId) {
        self.idle_queues
            .entry(task_type.clone())
            .or_default()
            .push_back(worker_id);
        metrics::IDLE_WORKERS.inc();
    }
}
