//! Wire protocol: messages, close codes, checksums.

pub mod checksum;
pub mod close;
pub mod message;

pub use checksum::sequence_checksum;
pub use close::{AppCloseCode, REASON_SEQUENCE_COMPLETE, close_code_name, is_application_code};
pub use message::{
    ACKNOWLEDGEMENT_TAG, FinalMessage, LAST_NUMBER_IN_SEQUENCE_TAG, MessageError,
    NUMBER_IN_SEQUENCE_TAG, WireMessage, decode_message, encode_message,
};
