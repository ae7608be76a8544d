use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt::{Display, Formatter};

/// Payload of the in-band drain sentinel. A worker that receives a task
/// whose buffer equals this exits after processing it.
pub const KILL_PAYLOAD: &[u8] = b"KILL";

const KILL_TASK_ID: &str = "KILL";

/// A task type tag, embedded in task ids as the suffix after the first `;`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub const RAW: &'static str = "RAW";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The default type, served by workers launched without a container.
    pub fn raw() -> Self {
        Self(Self::RAW.to_string())
    }

    pub fn is_raw(&self) -> bool {
        self.0 == Self::RAW
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskType {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl Borrow<str> for TaskType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Identity of a worker process, assigned by the manager at spawn time and
/// used as the first frame of every downlink message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_frame(frame: &Bytes) -> Result<Self, ProtocolError> {
        let id = std::str::from_utf8(frame)
            .map_err(|_| ProtocolError::MalformedPayload("worker id is not UTF-8".to_string()))?;
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_frame(&self) -> Bytes {
        Bytes::copy_from_slice(self.0.as_bytes())
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A task as handed out by the interchange. The manager reads the id to
/// route it and forwards the buffer untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(with = "base64_bytes")]
    pub buffer: Bytes,
}

impl Task {
    pub fn new(task_id: impl Into<String>, buffer: impl Into<Bytes>) -> Self {
        Self {
            task_id: task_id.into(),
            buffer: buffer.into(),
        }
    }

    /// The drain sentinel pushed onto a type queue to retire one worker of
    /// that type.
    pub fn kill() -> Self {
        Self {
            task_id: KILL_TASK_ID.to_string(),
            buffer: Bytes::from_static(KILL_PAYLOAD),
        }
    }

    pub fn is_kill(&self) -> bool {
        self.task_id == KILL_TASK_ID && self.buffer.as_ref() == KILL_PAYLOAD
    }

    /// Routing key: the suffix of the task id after the first `;`. Ids
    /// without a type tag route to `RAW`.
    pub fn task_type(&self) -> TaskType {
        match self.task_id.split_once(';') {
            Some((_, suffix)) if !suffix.is_empty() => TaskType::new(suffix),
            _ => TaskType::raw(),
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
