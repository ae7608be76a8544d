use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::metrics;
use crate::model::TaskQueues;
use crate::net::router::{WorkerEvent, WorkerRouter};
use crate::net::uplink::TaskUplink;
use crate::scheduler::naive_scheduler;
use crate::worker_map::WorkerMap;
use bytes::Bytes;
use htx_protocol::{InterchangeMessage, Registration, Task, TaskType, WorkerMessage};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum Polled {
    Interchange(InterchangeMessage),
    Worker(WorkerEvent),
    Idle,
}

/// The single-threaded event loop at the heart of the manager. Owns the
/// worker map, the task queues and both the task uplink and the worker
/// router; everything else talks to it through channels.
pub struct Dispatcher {
    uplink: TaskUplink,
    router: WorkerRouter,
    worker_map: WorkerMap,
    task_queues: TaskQueues,
    results_tx: mpsc::UnboundedSender<Bytes>,
    shutdown: CancellationToken,
    registration: Registration,
    heartbeat_period: Duration,
    heartbeat_threshold: Duration,
    poll_period: Duration,
    /// Configured queue size plus one slot per worker, the backlog the
    /// manager is willing to request from the interchange.
    max_queue_size: usize,
    task_recv: u64,
    task_done: u64,
    worker_plan: Vec<TaskType>,
    prev_plan: Option<BTreeMap<TaskType, usize>>,
    uplink_open: bool,
}

impl Dispatcher {
    pub fn new(
        config: &ManagerConfig,
        uplink: TaskUplink,
        router: WorkerRouter,
        worker_map: WorkerMap,
        results_tx: mpsc::UnboundedSender<Bytes>,
        registration: Registration,
        shutdown: CancellationToken,
    ) -> Self {
        let max_queue_size = config.max_queue_size + worker_map.capacity();
        Self {
            uplink,
            router,
            worker_map,
            task_queues: TaskQueues::new(),
            results_tx,
            shutdown,
            registration,
            heartbeat_period: config.heartbeat_period,
            heartbeat_threshold: config.heartbeat_threshold,
            poll_period: config.poll_period,
            max_queue_size,
            task_recv: 0,
            task_done: 0,
            worker_plan: Vec::new(),
            prev_plan: None,
            uplink_open: true,
        }
    }

    pub async fn run(mut self) -> Result<(), ManagerError> {
        // One RAW worker up front so the interchange sees capacity from the
        // start. A failed launch is retried by the scheduler.
        if let Err(e) = self.worker_map.add_worker(TaskType::raw()) {
            warn!("initial RAW worker failed to launch: {e}");
        }
        self.uplink.send_registration(&self.registration).await?;
        info!("registered with the interchange");

        let mut last_heartbeat = Instant::now();
        let mut last_interchange_contact = Instant::now();
        let mut poll_timer = self.poll_period;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let backlog = self.task_recv.saturating_sub(self.task_done) as usize;
            let ready = self.worker_map.ready_worker_count();

            if last_heartbeat.elapsed() >= self.heartbeat_period {
                match self.uplink.send_heartbeat().await {
                    Ok(()) => metrics::HEARTBEATS_SENT_TOTAL.inc(),
                    Err(e) => warn!("heartbeat send failed: {e}"),
                }
                last_heartbeat = Instant::now();
            }

            if backlog < self.max_queue_size && ready > 0 {
                debug!(ready, backlog, "requesting tasks");
                if let Err(e) = self.uplink.send_capacity_request(ready as u32).await {
                    warn!("capacity request failed: {e}");
                }
            }

            let polled = self.poll(poll_timer).await;

            // Everything the workers produced since the last tick.
            let mut polled_uplink = None;
            match polled {
                Polled::Worker(event) => self.handle_worker_event(event),
                Polled::Interchange(message) => polled_uplink = Some(message),
                Polled::Idle => {}
            }
            while let Ok(event) = self.router.events.try_recv() {
                self.handle_worker_event(event);
            }

            let spun_up = self.worker_map.spin_up_workers(&mut self.worker_plan);
            if spun_up > 0 {
                debug!(spun_up, "spun up workers");
            }

            // At most one interchange message per tick.
            let received = polled_uplink.or_else(|| self.uplink.incoming.try_recv().ok());
            match received {
                Some(message) => {
                    last_interchange_contact = Instant::now();
                    match message {
                        InterchangeMessage::Stop => {
                            info!("interchange requested stop");
                            self.shutdown.cancel();
                            return Ok(());
                        }
                        InterchangeMessage::Heartbeat => {
                            debug!("interchange heartbeat");
                        }
                        InterchangeMessage::Tasks(tasks) => {
                            // Obvious work ahead: skip the next poll sleep.
                            poll_timer = Duration::ZERO;
                            self.task_recv += tasks.len() as u64;
                            metrics::TASKS_RECEIVED_TOTAL.inc_by(tasks.len() as u64);
                            debug!(
                                count = tasks.len(),
                                total = self.task_recv,
                                "received task batch"
                            );
                            for task in tasks {
                                let task_type = task.task_type();
                                self.worker_map.note_task_seen(&task_type);
                                self.task_queues.push(&task_type, task);
                            }
                        }
                    }
                }
                None => {
                    let doubled = if poll_timer.is_zero() {
                        self.poll_period
                    } else {
                        poll_timer * 2
                    };
                    poll_timer = doubled.max(self.poll_period).min(self.heartbeat_period);
                    if last_interchange_contact.elapsed() > self.heartbeat_threshold {
                        error!(
                            "no contact with the interchange within {:?}, shutting down",
                            self.heartbeat_threshold
                        );
                        self.shutdown.cancel();
                        return Err(ManagerError::InterchangeLost);
                    }
                }
            }

            // Re-plan the pool and turn the delta into actions.
            let backlogs = self.task_queues.backlogs();
            let plan = naive_scheduler(
                &backlogs,
                self.worker_map.capacity(),
                self.prev_plan.as_ref(),
                self.worker_map.to_die(),
            );
            let spin_downs = self.worker_map.spin_down_workers(&plan);
            for task_type in spin_downs.keys() {
                self.remove_worker_init(task_type);
            }
            self.worker_plan = self.worker_map.get_next_worker_q(&plan);
            self.prev_plan = Some(plan);

            self.match_tasks()?;
        }
    }

    /// Waits up to `timeout` for either pipe to produce something.
    async fn poll(&mut self, timeout: Duration) -> Polled {
        tokio::select! {
            _ = self.shutdown.cancelled() => Polled::Idle,
            event = self.router.events.recv() => match event {
                Some(event) => Polled::Worker(event),
                None => Polled::Idle,
            },
            message = self.uplink.incoming.recv(), if self.uplink_open => match message {
                Some(message) => Polled::Interchange(message),
                None => {
                    // Reconnects are out of scope; silence now runs into
                    // the heartbeat threshold.
                    warn!("task pipe closed by the interchange");
                    self.uplink_open = false;
                    Polled::Idle
                }
            },
            _ = tokio::time::sleep(timeout) => Polled::Idle,
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message { worker_id, message } => match message {
                WorkerMessage::Register(registration) => {
                    self.worker_map.register(&worker_id, registration.worker_type);
                }
                WorkerMessage::TaskResult(payload) => {
                    if self.results_tx.send(payload).is_err() {
                        warn!("result pusher is gone, dropping a result");
                    }
                    self.worker_map.put_worker(&worker_id);
                    self.task_done += 1;
                    metrics::TASKS_COMPLETED_TOTAL.inc();
                }
                WorkerMessage::Die => {
                    debug!(%worker_id, "worker announced death");
                    self.worker_map.remove_worker(&worker_id);
                }
            },
            WorkerEvent::Gone { worker_id } => {
                debug!(%worker_id, "worker connection lost");
                self.worker_map.remove_worker(&worker_id);
            }
        }
    }

    /// Queues the drain of one worker of the type: one more outstanding
    /// kill plus the in-band sentinel at the tail of its task queue, so the
    /// doomed worker finishes the backlog queued before it.
    fn remove_worker_init(&mut self, task_type: &TaskType) {
        debug!(%task_type, "queueing a KILL sentinel");
        self.worker_map.request_drain(task_type);
        self.task_queues.push(task_type, Task::kill());
    }

    /// Matches queued tasks to idle workers, FIFO within each type.
    fn match_tasks(&mut self) -> Result<(), ManagerError> {
        let types: Vec<TaskType> = self.task_queues.types().cloned().collect();
        for task_type in types {
            loop {
                if self
                    .task_queues
                    .get_mut(&task_type)
                    .is_none_or(|queue| queue.is_empty())
                {
                    break;
                }
                let Some(worker_id) = self.worker_map.get_worker(&task_type) else {
                    break;
                };
                let Some(task) = self.task_queues.get_mut(&task_type).and_then(|q| q.pop())
                else {
                    self.worker_map.put_worker(&worker_id);
                    break;
                };
                debug!(task_id = %task.task_id, %worker_id, "dispatching task");
                if task.is_kill() {
                    self.worker_map.mark_draining(&worker_id);
                }
                self.router.send(&worker_id, &task)?;
            }
        }
        Ok(())
    }
}
