//! Application-level close codes.
//!
//! Custom codes sit in the private-use range of
//! https://www.rfc-editor.org/rfc/rfc6455#section-7.4.2

use tungstenite::protocol::frame::coding::CloseCode;

/// Reason carried by the final normal closure.
pub const REASON_SEQUENCE_COMPLETE: &str = "sequence complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCloseCode {
    ExpiredSession,
    MissingClientId,
    InvalidSequenceCount,
    InvalidLastReceived,
}

impl AppCloseCode {
    pub fn code(self) -> u16 {
        match self {
            AppCloseCode::ExpiredSession => 4001,
            AppCloseCode::MissingClientId => 4002,
            AppCloseCode::InvalidSequenceCount => 4003,
            AppCloseCode::InvalidLastReceived => 4004,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AppCloseCode::ExpiredSession => "ExpiredSession",
            AppCloseCode::MissingClientId => "MissingClientID",
            AppCloseCode::InvalidSequenceCount => "InvalidSequenceCount",
            AppCloseCode::InvalidLastReceived => "InvalidLastReceived",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4001 => Some(AppCloseCode::ExpiredSession),
            4002 => Some(AppCloseCode::MissingClientId),
            4003 => Some(AppCloseCode::InvalidSequenceCount),
            4004 => Some(AppCloseCode::InvalidLastReceived),
            _ => None,
        }
    }
}

impl From<AppCloseCode> for CloseCode {
    fn from(code: AppCloseCode) -> CloseCode {
        CloseCode::Library(code.code())
    }
}

/// True for the codes a client must treat as terminal rather than as a
/// transport failure to reconnect through.
pub fn is_application_code(code: u16) -> bool {
    AppCloseCode::from_code(code).is_some()
}

pub fn close_code_name(code: u16) -> &'static str {
    AppCloseCode::from_code(code)
        .map(AppCloseCode::name)
        .unwrap_or("UnknownCode")
}
