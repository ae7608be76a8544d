use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge, Registry,
};

lazy_static! {
    pub static ref TASKS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        "htx_manager_tasks_received_total",
        "Tasks received from the interchange"
    )
    .unwrap();
    pub static ref TASKS_COMPLETED_TOTAL: IntCounter = register_int_counter!(
        "htx_manager_tasks_completed_total",
        "Task results received from workers"
    )
    .unwrap();
    pub static ref RESULT_BATCHES_FLUSHED_TOTAL: IntCounter = register_int_counter!(
        "htx_manager_result_batches_flushed_total",
        "Result batches forwarded to the interchange"
    )
    .unwrap();
    pub static ref HEARTBEATS_SENT_TOTAL: IntCounter = register_int_counter!(
        "htx_manager_heartbeats_sent_total",
        "Heartbeats sent to the interchange"
    )
    .unwrap();
    pub static ref WORKERS_SPAWNED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "htx_manager_workers_spawned_total",
        "Worker processes launched, by task type",
        &["task_type"]
    )
    .unwrap();
    pub static ref WORKERS_REMOVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "htx_manager_workers_removed_total",
        "Workers removed from the worker map, by task type",
        &["task_type"]
    )
    .unwrap();
    pub static ref IDLE_WORKERS: IntGauge = register_int_gauge!(
        "htx_manager_idle_workers",
        "Workers currently idle across all task types"
    )
    .unwrap();
}

/// Forces registration of every metric and hands back the registry they
/// live in.
pub fn register_all() -> Registry {
    lazy_static::initialize(&TASKS_RECEIVED_TOTAL);
    lazy_static::initialize(&TASKS_COMPLETED_TOTAL);
    lazy_static::initialize(&RESULT_BATCHES_FLUSHED_TOTAL);
    lazy_static::initialize(&HEARTBEATS_SENT_TOTAL);
    lazy_static::initialize(&WORKERS_SPAWNED_TOTAL);
    lazy_static::initialize(&WORKERS_REMOVED_TOTAL);
    lazy_static::initialize(&IDLE_WORKERS);
    prometheus::default_registry().clone()
}
