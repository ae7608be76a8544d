pub mod frame;
pub mod message;
pub mod task;

pub use frame::{read_message, read_message_opt, write_message, MAX_FRAMES, MAX_FRAME_SIZE};
pub use message::{
    capacity_request_frame, heartbeat_frame, task_frames, InterchangeMessage, Registration,
    WorkerMessage, WorkerRegistration, HEARTBEAT_CODE,
};
pub use task::{Task, TaskType, WorkerId, KILL_PAYLOAD};

#[cfg(test)]
test_r::enable!();

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("wire I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("message declares {0} frames, limit is {MAX_FRAMES}")]
    TooManyFrames(u32),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(u32),
    #[error("expected a {expected}-frame message, got {got} frames")]
    FrameCount { expected: usize, got: usize },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unknown worker message tag {0:?}")]
    UnknownTag(String),
}
