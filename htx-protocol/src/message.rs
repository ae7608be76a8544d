use crate::task::{Task, TaskType, WorkerId};
use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Heartbeat marker exchanged with the interchange, `0xFFFFFFFF`.
pub const HEARTBEAT_CODE: u32 = u32::MAX;

const STOP_TEXT: &str = "STOP";

const TAG_REGISTER: &[u8] = b"REGISTER";
const TAG_TASK_RET: &[u8] = b"TASK_RET";
const TAG_WRKR_DIE: &[u8] = b"WRKR_DIE";

/// Registration record sent to the interchange right after connecting.
/// The key names are fixed by the interchange; the version keys are
/// free-form strings it only logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "parsl_v")]
    pub protocol_version: String,
    #[serde(rename = "python_v")]
    pub runtime_version: String,
    pub worker_count: usize,
    pub cores: usize,
    pub mem: f64,
    pub block_id: Option<String>,
    pub os: String,
    pub hname: String,
    pub dir: String,
}

impl Registration {
    pub fn to_frame(&self) -> Result<Bytes, ProtocolError> {
        let encoded = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
        Ok(Bytes::from(encoded))
    }
}

/// 4-byte little-endian heartbeat frame.
pub fn heartbeat_frame() -> Bytes {
    Bytes::copy_from_slice(&HEARTBEAT_CODE.to_le_bytes())
}

/// 4-byte little-endian request for `ready` more tasks.
pub fn capacity_request_frame(ready: u32) -> Bytes {
    Bytes::copy_from_slice(&ready.to_le_bytes())
}

/// Everything the interchange sends down the task pipe.
#[derive(Debug, Clone, PartialEq)]
pub enum InterchangeMessage {
    Tasks(Vec<Task>),
    Heartbeat,
    Stop,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UplinkPayload {
    Code(u32),
    Text(String),
    Tasks(Vec<Task>),
}

impl InterchangeMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match serde_json::from_slice::<UplinkPayload>(payload) {
            Ok(UplinkPayload::Code(HEARTBEAT_CODE)) => Ok(Self::Heartbeat),
            Ok(UplinkPayload::Code(other)) => Err(ProtocolError::MalformedPayload(format!(
                "unexpected control code {other}"
            ))),
            Ok(UplinkPayload::Text(text)) if text == STOP_TEXT => Ok(Self::Stop),
            Ok(UplinkPayload::Text(text)) => Err(ProtocolError::MalformedPayload(format!(
                "unexpected control text {text:?}"
            ))),
            Ok(UplinkPayload::Tasks(tasks)) => Ok(Self::Tasks(tasks)),
            Err(e) => Err(ProtocolError::MalformedPayload(e.to_string())),
        }
    }
}

/// Payload of a worker's REGISTER frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_type: TaskType,
}

/// Everything a worker sends up the downlink, minus the identity frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Register(WorkerRegistration),
    TaskResult(Bytes),
    Die,
}

impl WorkerMessage {
    /// Decodes the `(tag, payload)` tail of a worker frame-set.
    pub fn decode(tag: &Bytes, payload: Bytes) -> Result<Self, ProtocolError> {
        match tag.as_ref() {
            TAG_REGISTER => {
                let registration: WorkerRegistration = serde_json::from_slice(&payload)
                    .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
                Ok(Self::Register(registration))
            }
            TAG_TASK_RET => Ok(Self::TaskResult(payload)),
            TAG_WRKR_DIE => Ok(Self::Die),
            other => Err(ProtocolError::UnknownTag(
                String::from_utf8_lossy(other).to_string(),
            )),
        }
    }

    /// Encodes the `(tag, payload)` tail; the worker side of [`decode`].
    pub fn encode(&self) -> Result<(Bytes, Bytes), ProtocolError> {
        match self {
            Self::Register(registration) => {
                let payload = serde_json::to_vec(registration)
                    .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
                Ok((Bytes::from_static(TAG_REGISTER), Bytes::from(payload)))
            }
            Self::TaskResult(payload) => Ok((Bytes::from_static(TAG_TASK_RET), payload.clone())),
            Self::Die => Ok((Bytes::from_static(TAG_WRKR_DIE), Bytes::new())),
        }
    }
}

/// The three frames of a task dispatch to a worker. Regular task ids are
/// JSON-encoded; the drain sentinel travels as the literal bytes `KILL` in
/// both the id and buffer frames.
pub fn task_frames(worker_id: &WorkerId, task: &Task) -> Result<[Bytes; 3], ProtocolError> {
    let id_frame = if task.is_kill() {
        Bytes::from_static(crate::task::KILL_PAYLOAD)
    } else {
        let encoded = serde_json::to_vec(&task.task_id)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;
        Bytes::from(encoded)
    };
    Ok([worker_id.to_frame(), id_frame, task.buffer.clone()])
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    #[test]
    fn heartbeat_code_decodes() {
        let decoded = InterchangeMessage::decode(b"4294967295").unwrap();
        check!(decoded == InterchangeMessage::Heartbeat);
    }

    #[test]
    fn stop_decodes() {
        let decoded = InterchangeMessage::decode(b"\"STOP\"").unwrap();
        check!(decoded == InterchangeMessage::Stop);
    }

    #[test]
    fn task_batches_decode() {
        let payload = br#"[{"task_id":"t1;RAW","buffer":"qg=="},{"task_id":"t2;fft","buffer":""}]"#;
        let decoded = InterchangeMessage::decode(payload).unwrap();
        let InterchangeMessage::Tasks(tasks) = decoded else {
            panic!("expected a task batch");
        };
        check!(tasks.len() == 2);
        check!(tasks[0].buffer == vec![0xAA]);
        check!(tasks[1].task_type() == TaskType::new("fft"));
    }

    #[test]
    fn junk_payloads_are_rejected() {
        check!(InterchangeMessage::decode(b"not json").is_err());
        check!(InterchangeMessage::decode(b"\"CONTINUE\"").is_err());
        check!(InterchangeMessage::decode(b"17").is_err());
    }

    #[test]
    fn worker_messages_round_trip() {
        let register = WorkerMessage::Register(WorkerRegistration {
            worker_type: TaskType::raw(),
        });
        let (tag, payload) = register.encode().unwrap();
        check!(WorkerMessage::decode(&tag, payload).unwrap() == register);

        let result = WorkerMessage::TaskResult(Bytes::from_static(&[0xBB]));
        let (tag, payload) = result.encode().unwrap();
        check!(WorkerMessage::decode(&tag, payload).unwrap() == result);

        let (tag, payload) = WorkerMessage::Die.encode().unwrap();
        check!(WorkerMessage::decode(&tag, payload).unwrap() == WorkerMessage::Die);
    }

    #[test]
    fn unknown_worker_tags_are_rejected() {
        let result = WorkerMessage::decode(&Bytes::from_static(b"NOPE"), Bytes::new());
        check!(matches!(result, Err(ProtocolError::UnknownTag(_))));
    }

    #[test]
    fn dispatch_frames_json_encode_regular_ids() {
        let worker = WorkerId::new("3");
        let task = Task::new("t1;RAW", Bytes::from_static(&[0xAA]));
        let frames = task_frames(&worker, &task).unwrap();
        check!(frames[0] == "3");
        check!(frames[1] == "\"t1;RAW\"");
        check!(frames[2] == vec![0xAA]);
    }

    #[test]
    fn dispatch_frames_keep_the_kill_sentinel_literal() {
        let frames = task_frames(&WorkerId::new("3"), &Task::kill()).unwrap();
        check!(frames[1] == "KILL");
        check!(frames[2] == "KILL");
    }
}
