use crate::error::ManagerError;
use crate::net::tcp_endpoint;
use bytes::Bytes;
use htx_protocol::{
    capacity_request_frame, heartbeat_frame, read_message_opt, write_message, InterchangeMessage,
    Registration,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const INCOMING_BUFFER: usize = 1024;

/// Bidirectional pipe to the interchange's task queue. The write half
/// carries registration, heartbeats and capacity requests; a reader task
/// feeds parsed interchange messages into `incoming`. Nothing is flushed
/// on shutdown; pending frames are simply dropped.
pub struct TaskUplink {
    writer: OwnedWriteHalf,
    pub incoming: mpsc::Receiver<InterchangeMessage>,
}

impl TaskUplink {
    pub async fn connect(url: &str, uid: &str) -> Result<Self, ManagerError> {
        let (reader, writer) = connect_with_identity(url, uid).await?;
        let (tx, incoming) = mpsc::channel(INCOMING_BUFFER);
        tokio::spawn(read_interchange(reader, tx));
        Ok(Self { writer, incoming })
    }

    pub async fn send_registration(&mut self, registration: &Registration) -> Result<(), ManagerError> {
        let frame = registration.to_frame()?;
        write_message(&mut self.writer, &[frame]).await?;
        Ok(())
    }

    pub async fn send_heartbeat(&mut self) -> Result<(), ManagerError> {
        write_message(&mut self.writer, &[heartbeat_frame()]).await?;
        Ok(())
    }

    pub async fn send_capacity_request(&mut self, ready: u32) -> Result<(), ManagerError> {
        write_message(&mut self.writer, &[capacity_request_frame(ready)]).await?;
        Ok(())
    }
}

/// Outbound-only pipe to the interchange's result queue. Each batch is one
/// multipart message with one frame per result blob.
pub struct ResultUplink {
    writer: OwnedWriteHalf,
    // Kept open so the interchange does not see a half-closed peer.
    _reader: OwnedReadHalf,
}

impl ResultUplink {
    pub async fn connect(url: &str, uid: &str) -> Result<Self, ManagerError> {
        let (reader, writer) = connect_with_identity(url, uid).await?;
        Ok(Self {
            writer,
            _reader: reader,
        })
    }

    pub async fn send_batch(&mut self, items: &[Bytes]) -> Result<(), ManagerError> {
        for chunk in items.chunks(htx_protocol::MAX_FRAMES as usize) {
            write_message(&mut self.writer, chunk).await?;
        }
        Ok(())
    }
}

/// Connects and sends the single-frame HELLO carrying this manager's uid,
/// the stand-in for a socket identity.
async fn connect_with_identity(
    url: &str,
    uid: &str,
) -> Result<(OwnedReadHalf, OwnedWriteHalf), ManagerError> {
    let endpoint = tcp_endpoint(url)?;
    let stream = TcpStream::connect(&endpoint).await?;
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    write_message(&mut writer, &[Bytes::copy_from_slice(uid.as_bytes())]).await?;
    debug!(%endpoint, %uid, "uplink connected");
    Ok((reader, writer))
}

async fn read_interchange(mut reader: OwnedReadHalf, tx: mpsc::Sender<InterchangeMessage>) {
    loop {
        match read_message_opt(&mut reader).await {
            Ok(Some(frames)) => {
                // ZMQ-style transports prepend an empty delimiter frame;
                // the payload is always the last frame.
                let Some(payload) = frames.last() else {
                    continue;
                };
                match InterchangeMessage::decode(payload) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("dropping undecodable interchange message: {e}"),
                }
            }
            Ok(None) => {
                debug!("interchange closed the task pipe");
                return;
            }
            Err(e) => {
                warn!("task pipe read failed: {e}");
                return;
            }
        }
    }
}
