use htx_protocol::{Task, TaskType};
use std::collections::{BTreeMap, VecDeque};

/// Lifecycle of a worker process as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Launched, has not sent REGISTER yet.
    Pending,
    /// Registered and eligible for tasks.
    Active,
    /// Was handed a KILL sentinel and will exit on its own.
    Draining,
}

/// FIFO of tasks awaiting a worker of one type. Tracks how many of the
/// queued entries are drain sentinels so the scheduler can see the real
/// backlog.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    kill_count: usize,
}

impl TaskQueue {
    pub fn push(&mut self, task: Task) {
        if task.is_kill() {
            self.kill_count += 1;
        }
        self.tasks.push_back(task);
    }

    pub fn pop(&mut self) -> Option<Task> {
        let task = self.tasks.pop_front()?;
        if task.is_kill() {
            self.kill_count -= 1;
        }
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queued tasks that are not drain sentinels.
    pub fn real_backlog(&self) -> usize {
        self.tasks.len() - self.kill_count
    }
}

/// All per-type task queues. The `RAW` queue always exists; queues for
/// other types appear when the first task of that type arrives and are
/// never removed.
#[derive(Debug)]
pub struct TaskQueues {
    queues: BTreeMap<TaskType, TaskQueue>,
}

impl TaskQueues {
    pub fn new() -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(TaskType::raw(), TaskQueue::default());
        Self { queues }
    }

    pub fn ensure(&mut self, task_type: &TaskType) -> &mut TaskQueue {
        self.queues.entry(task_type.clone()).or_default()
    }

    pub fn get_mut(&mut self, task_type: &TaskType) -> Option<&mut TaskQueue> {
        self.queues.get_mut(task_type)
    }

    pub fn push(&mut self, task_type: &TaskType, task: Task) {
        self.ensure(task_type).push(task);
    }

    /// Real backlog per known type, in lexicographic type order.
    pub fn backlogs(&self) -> BTreeMap<TaskType, usize> {
        self.queues
            .iter()
            .map(|(task_type, queue)| (task_type.clone(), queue.real_backlog()))
            .collect()
    }

    pub fn types(&self) -> impl Iterator<Item = &TaskType> {
        self.queues.keys()
    }
}

impl Default for TaskQueues {
    fn default() -> Self {
        Self::new()
    }
}
