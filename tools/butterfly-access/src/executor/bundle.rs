//! Wire types for distributed execution
//!
//! Frame layout (little-endian):
//!
//! Header (16 bytes):
//!   magic:     u32 = 0x41434346  // "ACCF"
//!   version:   u16 = 1
//!   kind:      u8  = {0=job bundle, 1=task reply}
//!   reserved:  u8  = 0
//!   body_len:  u64
//!
//! Body (body_len bytes):
//!   bincode-encoded payload
//!
//! Footer (16 bytes):
//!   body_crc64:  u64
//!   frame_crc64: u64  // header + body

use butterfly_common::{Error, Result};
use crc::{Crc, CRC_64_GO_ISO};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::PacketResult;
use crate::inputs::SharedInputs;
use crate::partition::WorkPacket;

const MAGIC: u32 = 0x4143_4346; // "ACCF"
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 16;
const FOOTER_SIZE: usize = 16;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Payload type carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    JobBundle = 0,
    TaskReply = 1,
}

/// Shared inputs for one job, serialized once and shipped to every node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobBundle {
    pub job_id: u64,
    pub n_alternatives: usize,
    pub inputs: SharedInputs,
}

/// Borrowing twin of [`JobBundle`]; encodes to identical bytes
#[derive(Serialize)]
struct JobBundleRef<'a> {
    job_id: u64,
    n_alternatives: usize,
    inputs: &'a SharedInputs,
}

impl JobBundle {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_frame(FrameKind::JobBundle, self)
    }

    /// Encode without taking ownership of the inputs
    pub fn encode_parts(
        job_id: u64,
        n_alternatives: usize,
        inputs: &SharedInputs,
    ) -> Result<Vec<u8>> {
        let bundle = JobBundleRef {
            job_id,
            n_alternatives,
            inputs,
        };
        encode_frame(FrameKind::JobBundle, &bundle)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_frame(FrameKind::JobBundle, bytes)
    }
}

/// Per-packet work descriptor; carries no input data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketTask {
    pub job_id: u64,
    pub packet: WorkPacket,
}

/// How a task ended on its node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Completed(PacketResult),
    Failed {
        zone: Option<u32>,
        message: String,
    },
}

/// A node's answer for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReply {
    pub job_id: u64,
    pub packet_id: u32,
    pub node: usize,
    pub outcome: TaskOutcome,
}

impl TaskReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_frame(FrameKind::TaskReply, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_frame(FrameKind::TaskReply, bytes)
    }
}

fn encode_frame<T: Serialize>(kind: FrameKind, value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)
        .map_err(|e| Error::Distribution(format!("failed to encode {kind:?}: {e}")))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len() + FOOTER_SIZE);
    frame.extend_from_slice(&MAGIC.to_le_bytes());
    frame.extend_from_slice(&VERSION.to_le_bytes());
    frame.push(kind as u8);
    frame.push(0); // reserved
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);

    let body_crc64 = CRC64.checksum(&body);
    let frame_crc64 = CRC64.checksum(&frame);
    frame.extend_from_slice(&body_crc64.to_le_bytes());
    frame.extend_from_slice(&frame_crc64.to_le_bytes());
    Ok(frame)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn decode_frame<T: DeserializeOwned>(kind: FrameKind, bytes: &[u8]) -> Result<T> {
    if bytes.len() < HEADER_SIZE + FOOTER_SIZE {
        return Err(Error::Distribution(format!(
            "{kind:?} frame truncated: {} bytes",
            bytes.len()
        )));
    }

    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != MAGIC {
        return Err(Error::Distribution(format!(
            "invalid frame magic: expected 0x{MAGIC:08x}, got 0x{magic:08x}"
        )));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(Error::Distribution(format!(
            "unsupported frame version {version}"
        )));
    }
    if bytes[6] != kind as u8 {
        return Err(Error::Distribution(format!(
            "expected {kind:?} frame, got kind {}",
            bytes[6]
        )));
    }

    // Untrusted until the checksums pass: compare without arithmetic on it
    let body_len = read_u64(&bytes[8..16]);
    let available = (bytes.len() - HEADER_SIZE - FOOTER_SIZE) as u64;
    if body_len != available {
        return Err(Error::Distribution(format!(
            "{kind:?} frame size mismatch: header says {body_len} body bytes, frame has {}",
            bytes.len()
        )));
    }

    let body_end = bytes.len() - FOOTER_SIZE;
    let body = &bytes[HEADER_SIZE..body_end];
    let body_crc64 = read_u64(&bytes[body_end..body_end + 8]);
    let frame_crc64 = read_u64(&bytes[body_end + 8..]);
    if CRC64.checksum(body) != body_crc64 || CRC64.checksum(&bytes[..body_end]) != frame_crc64 {
        return Err(Error::Distribution(format!("{kind:?} frame checksum mismatch")));
    }

    bincode::deserialize(body)
        .map_err(|e| Error::Distribution(format!("failed to decode {kind:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::sample_inputs;

    fn bundle() -> JobBundle {
        JobBundle {
            job_id: 7,
            n_alternatives: 1,
            inputs: sample_inputs(12),
        }
    }

    #[test]
    fn test_job_bundle_survives_framing() {
        let original = bundle();
        let bytes = original.encode().unwrap();
        assert_eq!(&bytes[..4], &MAGIC.to_le_bytes());
        assert_eq!(JobBundle::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn test_borrowed_encoding_matches_owned() {
        let original = bundle();
        let borrowed =
            JobBundle::encode_parts(original.job_id, original.n_alternatives, &original.inputs)
                .unwrap();
        assert_eq!(borrowed, original.encode().unwrap());
    }

    #[test]
    fn test_corrupted_body_detected() {
        let mut bytes = bundle().encode().unwrap();
        bytes[HEADER_SIZE + 3] ^= 0xff;
        let err = JobBundle::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let bytes = bundle().encode().unwrap();
        assert!(matches!(
            JobBundle::decode(&bytes[..bytes.len() - 1]),
            Err(Error::Distribution(_))
        ));
        assert!(matches!(JobBundle::decode(&[0u8; 8]), Err(Error::Distribution(_))));
    }

    #[test]
    fn test_frame_kind_checked() {
        let reply = TaskReply {
            job_id: 1,
            packet_id: 3,
            node: 0,
            outcome: TaskOutcome::Failed {
                zone: Some(9),
                message: "boom".to_string(),
            },
        };
        let bytes = reply.encode().unwrap();
        assert_eq!(TaskReply::decode(&bytes).unwrap(), reply);
        let err = JobBundle::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("expected JobBundle frame"));
    }

    #[test]
    fn test_oversized_length_header_rejected() {
        let reply = TaskReply {
            job_id: 2,
            packet_id: 1,
            node: 1,
            outcome: TaskOutcome::Failed {
                zone: None,
                message: "node down".to_string(),
            },
        };
        let mut bytes = reply.encode().unwrap();
        bytes[8..16].copy_from_slice(&u64::MAX.to_le_bytes());

        let err = TaskReply::decode(&bytes).unwrap_err();
        assert!(matches!(err, Error::Distribution(_)));
        assert!(err.to_string().contains("size mismatch"));
    }
}
