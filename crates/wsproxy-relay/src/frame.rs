//! Frames relayed between the two sides and the close-frame rules

use bytes::Bytes;
use thiserror::Error;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_TLS_HANDSHAKE: u16 = 1015;

/// Close frame payload is limited to 125 bytes, two of them for the code
const MAX_CLOSE_REASON: usize = 123;

/// A data or close message as seen by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(CloseFrame),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Close(_) => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_NORMAL, reason)
    }

    /// Close frame to forward after a failed read.
    ///
    /// A peer close is echoed with its own code and reason when that code may
    /// be sent on the wire. Anything else becomes a normal closure carrying
    /// the error text.
    pub fn for_error(err: &FrameError) -> Self {
        match err {
            FrameError::Close { code, reason } if is_sendable(*code) => {
                Self::new(*code, reason.clone())
            }
            other => Self::normal(other.to_string()),
        }
    }
}

/// Codes reserved for local reporting must never appear in a close frame
pub fn is_sendable(code: u16) -> bool {
    !matches!(
        code,
        CLOSE_NO_STATUS | CLOSE_ABNORMAL | CLOSE_TLS_HANDSHAKE
    )
}

/// Failure while reading from or writing to one side
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The peer closed the connection, or it ended without a close frame (1006)
    #[error("websocket: close {code} {reason}")]
    Close { code: u16, reason: String },

    #[error("websocket: {0}")]
    Transport(String),
}

impl FrameError {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        FrameError::Close {
            code,
            reason: reason.into(),
        }
    }

    /// Stream ended without a close frame
    pub fn unexpected_eof() -> Self {
        Self::close(CLOSE_ABNORMAL, "unexpected EOF")
    }

    /// A protocol close with a code other than abnormal closure.
    ///
    /// These are the expected way for a session to end and are not logged
    /// again by the coordinator.
    pub fn is_graceful_close(&self) -> bool {
        matches!(self, FrameError::Close { code, .. } if *code != CLOSE_ABNORMAL)
    }
}
