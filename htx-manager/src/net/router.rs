use crate::error::ManagerError;
use bytes::Bytes;
use htx_protocol::{
    read_message_opt, task_frames, write_message, ProtocolError, Task, WorkerId, WorkerMessage,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 1024;

/// Something a worker connection produced.
#[derive(Debug)]
pub enum WorkerEvent {
    Message {
        worker_id: WorkerId,
        message: WorkerMessage,
    },
    /// The connection closed without a WRKR_DIE; treated the same way.
    Gone { worker_id: WorkerId },
}

/// Router-style endpoint the local workers connect back to. Inbound
/// frame-sets surface as [`WorkerEvent`]s; outbound sends are addressed by
/// worker id and queue without bound, since same-host workers are presumed
/// to keep up.
pub struct WorkerRouter {
    pub events: mpsc::Receiver<WorkerEvent>,
    outbound: mpsc::UnboundedSender<(WorkerId, [Bytes; 3])>,
    pub port: u16,
}

impl WorkerRouter {
    /// Binds the first free loopback port in the configured range and
    /// starts the accept loop.
    pub async fn bind(address: &str, port_range: (u16, u16)) -> Result<Self, ManagerError> {
        let (listener, port) = bind_in_range(address, port_range).await?;
        info!(%address, port, "listening for worker connections");
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(route(listener, events_tx, outbound_rx));
        Ok(Self {
            events,
            outbound,
            port,
        })
    }

    /// Queues one task dispatch for the given worker.
    pub fn send(&self, worker_id: &WorkerId, task: &Task) -> Result<(), ManagerError> {
        let frames = task_frames(worker_id, task)?;
        self.outbound
            .send((worker_id.clone(), frames))
            .map_err(|_| ManagerError::Internal("worker router is gone".to_string()))
    }
}

async fn bind_in_range(
    address: &str,
    (min_port, max_port): (u16, u16),
) -> Result<(TcpListener, u16), ManagerError> {
    for port in min_port..=max_port {
        match TcpListener::bind((address, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(_) => continue,
        }
    }
    Err(ManagerError::Config(format!(
        "no free worker port in {min_port}..={max_port} on {address}"
    )))
}

enum Control {
    Identified {
        peer: SocketAddr,
        worker_id: WorkerId,
    },
    Closed {
        peer: SocketAddr,
        worker_id: Option<WorkerId>,
    },
}

async fn route(
    listener: TcpListener,
    events_tx: mpsc::Sender<WorkerEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<(WorkerId, [Bytes; 3])>,
) {
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    // Write halves are parked under the peer address until the first
    // message names the worker.
    let mut unidentified: HashMap<SocketAddr, OwnedWriteHalf> = HashMap::new();
    let mut writers: HashMap<WorkerId, OwnedWriteHalf> = HashMap::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, writer) = stream.into_split();
                    unidentified.insert(peer, writer);
                    tokio::spawn(read_worker(peer, reader, events_tx.clone(), control_tx.clone()));
                }
                Err(e) => warn!("worker accept failed: {e}"),
            },
            Some(control) = control_rx.recv() => match control {
                Control::Identified { peer, worker_id } => {
                    if let Some(writer) = unidentified.remove(&peer) {
                        writers.insert(worker_id, writer);
                    }
                }
                Control::Closed { peer, worker_id } => {
                    unidentified.remove(&peer);
                    if let Some(worker_id) = worker_id {
                        writers.remove(&worker_id);
                        if events_tx.send(WorkerEvent::Gone { worker_id }).await.is_err() {
                            return;
                        }
                    }
                }
            },
            Some((worker_id, frames)) = outbound_rx.recv() => {
                match writers.get_mut(&worker_id) {
                    Some(writer) => {
                        if let Err(e) = write_message(writer, &frames).await {
                            warn!(%worker_id, "worker send failed: {e}");
                        }
                    }
                    None => warn!(%worker_id, "dropping dispatch to a departed worker"),
                }
            },
            _ = events_tx.closed() => return,
        }
    }
}

async fn read_worker(
    peer: SocketAddr,
    mut reader: OwnedReadHalf,
    events_tx: mpsc::Sender<WorkerEvent>,
    control_tx: mpsc::UnboundedSender<Control>,
) {
    let mut identity: Option<WorkerId> = None;
    loop {
        match read_message_opt(&mut reader).await {
            Ok(Some(frames)) => match parse_worker_frames(&frames) {
                Ok((worker_id, message)) => {
                    if identity.is_none() {
                        identity = Some(worker_id.clone());
                        let _ = control_tx.send(Control::Identified {
                            peer,
                            worker_id: worker_id.clone(),
                        });
                    }
                    if events_tx
                        .send(WorkerEvent::Message { worker_id, message })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => warn!(%peer, "dropping undecodable worker message: {e}"),
            },
            Ok(None) => {
                debug!(%peer, "worker connection closed");
                break;
            }
            Err(e) => {
                warn!(%peer, "worker connection failed: {e}");
                break;
            }
        }
    }
    let _ = control_tx.send(Control::Closed {
        peer,
        worker_id: identity,
    });
}

fn parse_worker_frames(frames: &[Bytes]) -> Result<(WorkerId, WorkerMessage), ProtocolError> {
    if !(2..=3).contains(&frames.len()) {
        return Err(ProtocolError::FrameCount {
            expected: 3,
            got: frames.len(),
        });
    }
    let worker_id = WorkerId::from_frame(&frames[0])?;
    let payload = frames.get(2).cloned().unwrap_or_default();
    let message = WorkerMessage::decode(&frames[1], payload)?;
    Ok((worker_id, message))
}
