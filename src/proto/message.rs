//! Message framing (one-byte tag + payload).

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NUMBER_IN_SEQUENCE_TAG: u8 = 0x01;
pub const ACKNOWLEDGEMENT_TAG: u8 = 0x02;
pub const LAST_NUMBER_IN_SEQUENCE_TAG: u8 = 0x03;

const U32_PAYLOAD_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {tag:#04x}")]
    UnknownTag { tag: u8 },
    #[error("payload for tag {tag:#04x} must be {expected} bytes, got {got}")]
    PayloadLength { tag: u8, expected: usize, got: usize },
    #[error("final message payload invalid: {0}")]
    FinalPayload(#[from] serde_json::Error),
}

/// Body of the terminal frame: the last value plus the server's checksum
/// over the whole sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalMessage {
    pub number: u32,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    NumberInSequence { number: u32 },
    Acknowledgement { index: u32 },
    LastNumberInSequence(FinalMessage),
}

impl WireMessage {
    pub fn tag(&self) -> u8 {
        match self {
            WireMessage::NumberInSequence { .. } => NUMBER_IN_SEQUENCE_TAG,
            WireMessage::Acknowledgement { .. } => ACKNOWLEDGEMENT_TAG,
            WireMessage::LastNumberInSequence(_) => LAST_NUMBER_IN_SEQUENCE_TAG,
        }
    }
}

pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>, MessageError> {
    match message {
        WireMessage::NumberInSequence { number } => {
            Ok(encode_u32_frame(NUMBER_IN_SEQUENCE_TAG, *number))
        }
        WireMessage::Acknowledgement { index } => Ok(encode_u32_frame(ACKNOWLEDGEMENT_TAG, *index)),
        WireMessage::LastNumberInSequence(final_message) => {
            let body = serde_json::to_vec(final_message)?;
            let mut buf = Vec::with_capacity(1 + body.len());
            buf.push(LAST_NUMBER_IN_SEQUENCE_TAG);
            buf.extend_from_slice(&body);
            Ok(buf)
        }
    }
}

pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, MessageError> {
    let (&tag, payload) = bytes.split_first().ok_or(MessageError::Empty)?;
    match tag {
        NUMBER_IN_SEQUENCE_TAG => Ok(WireMessage::NumberInSequence {
            number: decode_u32_payload(tag, payload)?,
        }),
        ACKNOWLEDGEMENT_TAG => Ok(WireMessage::Acknowledgement {
            index: decode_u32_payload(tag, payload)?,
        }),
        LAST_NUMBER_IN_SEQUENCE_TAG => Ok(WireMessage::LastNumberInSequence(
            serde_json::from_slice(payload)?,
        )),
        _ => Err(MessageError::UnknownTag { tag }),
    }
}

fn encode_u32_frame(tag: u8, value: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + U32_PAYLOAD_LEN);
    buf.push(tag);
    buf.extend_from_slice(&value.to_le_bytes());
    buf
}

fn decode_u32_payload(tag: u8, payload: &[u8]) -> Result<u32, MessageError> {
    let fixed: [u8; U32_PAYLOAD_LEN] =
        payload
            .try_into()
            .map_err(|_| MessageError::PayloadLength {
                tag,
                expected: U32_PAYLOAD_LEN,
                got: payload.len(),
            })?;
    Ok(u32::from_le_bytes(fixed))
}
