use bytes::Bytes;
use htx_manager::config::{ManagerConfig, WorkerMode};
use htx_manager::spawner::{LaunchSpec, WorkerHandle, WorkerLauncher};
use htx_protocol::{
    read_message, write_message, Task, TaskType, WorkerId, WorkerMessage, WorkerRegistration,
    HEARTBEAT_CODE, KILL_PAYLOAD,
};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Hard ceiling for every await in the suite; anything slower is a hang.
pub async fn eventually<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("timed out waiting for the manager")
}

/// Launcher that records launch requests instead of spawning processes;
/// tests connect fake workers using the recorded specs.
pub struct ChannelLauncher {
    launches: mpsc::UnboundedSender<LaunchSpec>,
}

impl ChannelLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LaunchSpec>) {
        let (launches, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { launches }), rx)
    }
}

impl WorkerLauncher for ChannelLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<WorkerHandle> {
        self.launches
            .send(spec.clone())
            .map_err(|_| io::Error::other("test launcher closed"))?;
        Ok(WorkerHandle::detached())
    }
}

/// A config pinned to a capacity of 4 regardless of the host's core count.
pub fn test_config(interchange: &FakeInterchange) -> ManagerConfig {
    ManagerConfig {
        task_url: interchange.task_url.clone(),
        result_url: interchange.result_url.clone(),
        uid: "test-manager".to_string(),
        block_id: Some("block-0".to_string()),
        cores_per_worker: 0.25,
        max_workers: 4,
        max_queue_size: 10,
        heartbeat_period: Duration::from_secs(30),
        heartbeat_threshold: Duration::from_secs(120),
        poll_period: Duration::from_millis(10),
        worker_port_range: (51000, 59000),
        mode: WorkerMode::NoContainer,
        container_image: None,
        logdir: None,
        debug: false,
    }
}

/// The interchange side of both uplinks.
pub struct FakeInterchange {
    pub task_url: String,
    pub result_url: String,
    task_listener: TcpListener,
    result_listener: TcpListener,
}

impl FakeInterchange {
    pub async fn bind() -> Self {
        let task_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let task_url = format!("tcp://{}", task_listener.local_addr().unwrap());
        let result_url = format!("tcp://{}", result_listener.local_addr().unwrap());
        Self {
            task_url,
            result_url,
            task_listener,
            result_listener,
        }
    }

    /// Accepts the manager's task and result connections and consumes both
    /// identity HELLOs.
    pub async fn accept(self) -> InterchangeConn {
        let (mut task, _) = self.task_listener.accept().await.unwrap();
        let hello = read_message(&mut task).await.unwrap();
        let uid = String::from_utf8(hello[0].to_vec()).unwrap();
        let (mut result, _) = self.result_listener.accept().await.unwrap();
        let _ = read_message(&mut result).await.unwrap();
        InterchangeConn { task, result, uid }
    }
}

/// What the manager sends on the task uplink.
#[derive(Debug)]
pub enum ManagerFrame {
    Registration(serde_json::Value),
    Heartbeat,
    CapacityRequest(u32),
}

pub struct InterchangeConn {
    task: TcpStream,
    result: TcpStream,
    pub uid: String,
}

impl InterchangeConn {
    pub async fn next_frame(&mut self) -> ManagerFrame {
        let frames = read_message(&mut self.task).await.unwrap();
        let payload = frames.last().unwrap();
        if payload.len() == 4 {
            let code = u32::from_le_bytes(payload.as_ref().try_into().unwrap());
            if code == HEARTBEAT_CODE {
                ManagerFrame::Heartbeat
            } else {
                ManagerFrame::CapacityRequest(code)
            }
        } else {
            ManagerFrame::Registration(serde_json::from_slice(payload).unwrap())
        }
    }

    pub async fn expect_registration(&mut self) -> serde_json::Value {
        match self.next_frame().await {
            ManagerFrame::Registration(registration) => registration,
            other => panic!("expected a registration frame, got {other:?}"),
        }
    }

    pub async fn wait_for_capacity_request(&mut self, at_least: u32) -> u32 {
        loop {
            if let ManagerFrame::CapacityRequest(count) = self.next_frame().await {
                if count >= at_least {
                    return count;
                }
            }
        }
    }

    pub async fn send_tasks(&mut self, tasks: &[Task]) {
        let payload = Bytes::from(serde_json::to_vec(tasks).unwrap());
        write_message(&mut self.task, &[payload]).await.unwrap();
    }

    pub async fn send_heartbeat(&mut self) {
        let payload = Bytes::from(serde_json::to_vec(&HEARTBEAT_CODE).unwrap());
        write_message(&mut self.task, &[payload]).await.unwrap();
    }

    pub async fn send_stop(&mut self) {
        let payload = Bytes::from(serde_json::to_vec("STOP").unwrap());
        write_message(&mut self.task, &[payload]).await.unwrap();
    }

    /// One result batch, one frame per result blob.
    pub async fn recv_results(&mut self) -> Vec<Bytes> {
        read_message(&mut self.result).await.unwrap()
    }
}

/// What happened to a scripted worker.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerEnd {
    Killed(WorkerId),
    Disconnected(WorkerId),
}

/// A worker process stand-in speaking the downlink protocol.
pub struct FakeWorker {
    pub id: WorkerId,
    stream: TcpStream,
}

impl FakeWorker {
    pub async fn connect(spec: &LaunchSpec) -> Self {
        let mut stream = TcpStream::connect((spec.address.as_str(), spec.port))
            .await
            .unwrap();
        let registration = WorkerMessage::Register(WorkerRegistration {
            worker_type: spec.worker_type.clone(),
        });
        let (tag, payload) = registration.encode().unwrap();
        write_message(&mut stream, &[spec.worker_id.to_frame(), tag, payload])
            .await
            .unwrap();
        Self {
            id: spec.worker_id.clone(),
            stream,
        }
    }

    /// Returns the `(serialized_task_id, buffer)` frames of the next
    /// dispatched task.
    pub async fn recv_task(&mut self) -> (Bytes, Bytes) {
        let frames = read_message(&mut self.stream).await.unwrap();
        assert_eq!(frames[0], self.id.to_frame(), "dispatch addressed wrongly");
        (frames[1].clone(), frames[2].clone())
    }

    pub async fn send_result(&mut self, payload: &[u8]) {
        let (tag, payload) =
            WorkerMessage::TaskResult(Bytes::copy_from_slice(payload)).encode().unwrap();
        write_message(&mut self.stream, &[self.id.to_frame(), tag, payload])
            .await
            .unwrap();
    }

    pub async fn send_die(mut self) {
        let (tag, payload) = WorkerMessage::Die.encode().unwrap();
        write_message(&mut self.stream, &[self.id.to_frame(), tag, payload])
            .await
            .unwrap();
    }

    /// Behaves like a real worker: echoes a fixed result for every task and
    /// exits on the KILL sentinel. Reports how it ended on `ends`.
    pub fn serve(mut self, ends: mpsc::UnboundedSender<WorkerEnd>) {
        tokio::spawn(async move {
            loop {
                let frames = match read_message(&mut self.stream).await {
                    Ok(frames) => frames,
                    Err(_) => {
                        let _ = ends.send(WorkerEnd::Disconnected(self.id.clone()));
                        return;
                    }
                };
                if frames[2].as_ref() == KILL_PAYLOAD {
                    let id = self.id.clone();
                    self.send_die().await;
                    let _ = ends.send(WorkerEnd::Killed(id));
                    return;
                }
                self.send_result(&[0xEE]).await;
            }
        });
    }
}

/// Waits for the next launch of the given type and connects a fake worker
/// for it.
pub async fn connect_next_worker(
    launches: &mut mpsc::UnboundedReceiver<LaunchSpec>,
    expected_type: &TaskType,
) -> FakeWorker {
    loop {
        let spec = launches.recv().await.expect("launcher channel closed");
        if spec.worker_type == *expected_type {
            return FakeWorker::connect(&spec).await;
        }
    }
}
