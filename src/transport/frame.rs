//! Frame encoding and decoding.
//!
//! Wire format, before byte stuffing:
//! ```text
//! +-------------+-----------+-----------+---------+-------------+----------+
//! | Network ID  | Device ID | Sequence  | Length  | Payload     | Checksum |
//! | 32 bytes    | 1 (i8)    | 2 (BE16)  | 1 byte  | 1-174 bytes | 4 bytes  |
//! +-------------+-----------+-----------+---------+-------------+----------+
//! ```
//! The checksum is the first four bytes of SHA-256 over everything before
//! it. The whole structure is then byte-stuffed and wrapped in a `0x00`
//! delimiter on each side:
//! ```text
//! [0x00][stuffed(header | payload | checksum)][0x00]
//! ```

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::cobs::{self, StuffingError};
use crate::core::constants::{
    CHECKSUM_SIZE, FRAME_DELIMITER, HEADER_SIZE, MAX_PAYLOAD_SIZE, NETWORK_ID_SIZE,
};
use crate::core::{ControlMessage, DeviceId, IdentifierError, NetworkId};

/// Errors building or parsing a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Network id is not exactly 32 bytes.
    #[error("network id must be 32 bytes, got {0}")]
    InvalidNetworkId(usize),

    /// Device id outside `[-64, 64]`.
    #[error("device id {0} outside [-64, 64]")]
    DeviceIdOutOfRange(i8),

    /// Payload is empty.
    #[error("payload is empty")]
    EmptyPayload,

    /// Payload exceeds the per-frame maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Offered payload size.
        size: usize,
        /// Maximum payload size.
        max: usize,
    },

    /// Leading or trailing delimiter missing.
    #[error("missing frame delimiter")]
    MissingDelimiter,

    /// Byte stuffing could not be removed.
    #[error("byte stuffing: {0}")]
    Stuffing(#[from] StuffingError),

    /// Frame is too short.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected size.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// Payload length does not match the frame size.
    #[error("payload length mismatch: header says {expected}, but {actual} bytes available")]
    PayloadLengthMismatch {
        /// Payload length from the header.
        expected: usize,
        /// Bytes available for payload.
        actual: usize,
    },

    /// Checksum does not match the frame contents.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

impl FrameError {
    /// Whether this error can come from parsing received bytes.
    ///
    /// Such frames are discarded without any response.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            FrameError::MissingDelimiter
                | FrameError::Stuffing(_)
                | FrameError::TooShort { .. }
                | FrameError::PayloadLengthMismatch { .. }
                | FrameError::PayloadTooLarge { .. }
                | FrameError::ChecksumMismatch
                | FrameError::DeviceIdOutOfRange(_)
        )
    }
}

impl From<IdentifierError> for FrameError {
    fn from(e: IdentifierError) -> Self {
        match e {
            IdentifierError::NetworkIdLength(len) => FrameError::InvalidNetworkId(len),
            IdentifierError::DeviceIdOutOfRange(id) => FrameError::DeviceIdOutOfRange(id),
            IdentifierError::SlotOutOfRange(slot) => {
                FrameError::DeviceIdOutOfRange(slot.min(i8::MAX as u8) as i8)
            }
        }
    }
}

/// A decoded TelemXnet frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    network_id: NetworkId,
    device_id: DeviceId,
    sequence: u16,
    payload: Bytes,
}

impl Frame {
    /// Create a frame, validating the payload size.
    pub fn new(
        network_id: NetworkId,
        device_id: DeviceId,
        sequence: u16,
        payload: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        let payload = payload.into();
        validate_payload(&payload)?;
        Ok(Self {
            network_id,
            device_id,
            sequence,
            payload,
        })
    }

    /// Create a control frame from `slot` carrying `message`.
    ///
    /// `slot` must be non-zero: slot 0 yields a data frame, which the relay
    /// routes as data instead of acting on the message.
    pub fn control(
        network_id: NetworkId,
        slot: DeviceId,
        sequence: u16,
        message: ControlMessage,
    ) -> Self {
        Self {
            network_id,
            device_id: slot.as_control(),
            sequence,
            payload: Bytes::from_static(message.as_bytes()),
        }
    }

    /// Network this frame belongs to.
    pub fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    /// Sending device id (negative for control frames).
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Sender's sequence number.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Frame payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the frame, returning its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Whether this is a control frame.
    pub fn is_control(&self) -> bool {
        self.device_id.is_control()
    }

    /// The control message, if this is a control frame with a known payload.
    pub fn control_message(&self) -> Option<ControlMessage> {
        if self.is_control() {
            ControlMessage::from_bytes(&self.payload)
        } else {
            None
        }
    }

    /// Encode to delimited wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut raw = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE);
        raw.extend_from_slice(self.network_id.as_bytes());
        raw.push(self.device_id.get() as u8);
        raw.extend_from_slice(&self.sequence.to_be_bytes());
        raw.push(self.payload.len() as u8);
        raw.extend_from_slice(&self.payload);
        let digest = checksum(&raw);
        raw.extend_from_slice(&digest);

        let stuffed = cobs::encode(&raw);
        let mut out = Vec::with_capacity(stuffed.len() + 2);
        out.push(FRAME_DELIMITER);
        out.extend_from_slice(&stuffed);
        out.push(FRAME_DELIMITER);
        Bytes::from(out)
    }

    /// Decode delimited wire bytes.
    ///
    /// Any failure means the bytes are noise and should be dropped.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 2
            || bytes[0] != FRAME_DELIMITER
            || bytes[bytes.len() - 1] != FRAME_DELIMITER
        {
            return Err(FrameError::MissingDelimiter);
        }

        let raw = cobs::decode(&bytes[1..bytes.len() - 1])?;
        let min = HEADER_SIZE + 1 + CHECKSUM_SIZE;
        if raw.len() < min {
            return Err(FrameError::TooShort {
                expected: min,
                actual: raw.len(),
            });
        }

        let payload_len = raw[HEADER_SIZE - 1] as usize;
        let available = raw.len() - HEADER_SIZE - CHECKSUM_SIZE;
        if payload_len != available {
            return Err(FrameError::PayloadLengthMismatch {
                expected: payload_len,
                actual: available,
            });
        }

        let (body, digest) = raw.split_at(raw.len() - CHECKSUM_SIZE);
        if checksum(body)[..] != *digest {
            return Err(FrameError::ChecksumMismatch);
        }

        let network_id = NetworkId::from_slice(&body[..NETWORK_ID_SIZE])?;
        let device_id = DeviceId::new(body[NETWORK_ID_SIZE] as i8)?;
        let sequence = u16::from_be_bytes([body[NETWORK_ID_SIZE + 1], body[NETWORK_ID_SIZE + 2]]);
        let payload = Bytes::copy_from_slice(&body[HEADER_SIZE..]);
        validate_payload(&payload)?;

        Ok(Self {
            network_id,
            device_id,
            sequence,
            payload,
        })
    }
}

/// Encode a frame from raw field values.
///
/// Validation happens before any encoding work: the network id must be 32
/// bytes, the device id within `[-64, 64]`, and the payload 1-174 bytes.
pub fn encode(
    network_id: &[u8],
    device_id: i8,
    sequence: u16,
    payload: &[u8],
) -> Result<Bytes, FrameError> {
    let network_id = NetworkId::from_slice(network_id)?;
    let device_id = DeviceId::new(device_id)?;
    validate_payload(payload)?;
    let frame = Frame::new(network_id, device_id, sequence, Bytes::copy_from_slice(payload))?;
    Ok(frame.encode())
}

/// Decode a frame from delimited wire bytes.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    Frame::decode(bytes)
}

fn validate_payload(payload: &[u8]) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

fn checksum(data: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest[..CHECKSUM_SIZE]);
    out
}
