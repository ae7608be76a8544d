use htx_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no contact with the interchange within the heartbeat threshold")]
    InterchangeLost,
    #[error("wire protocol failure: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("worker launch failed: {0}")]
    Spawn(String),
    #[error("internal failure: {0}")]
    Internal(String),
}
