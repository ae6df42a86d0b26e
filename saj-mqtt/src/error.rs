//! Error types for the SAJ MQTT transport.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using [`SajError`].
pub type Result<T> = std::result::Result<T, SajError>;

/// Errors raised while decoding a frame.
///
/// These are stored as the terminal outcome of a pending request when the
/// response that matched it fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Undersized or structurally invalid buffer.
    #[error("malformed frame: {0}")]
    Format(String),

    /// Trailing checksum does not match the frame content.
    #[error("CRC mismatch: frame carries {expected:04x}, computed {computed:04x}")]
    Integrity { expected: u16, computed: u16 },

    /// Operation kind or content does not match the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FrameError {
    /// Create a format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Errors returned by the session and the query/write API.
#[derive(Debug, Error)]
pub enum SajError {
    /// A call was attempted while the session is not connected.
    #[error("MQTT session is not connected")]
    NotConnected,

    /// The response subscription was not acknowledged in time.
    #[error("connection to MQTT broker timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// No resolving response arrived in time.
    #[error("{outstanding} request(s) got no response within {timeout:?}")]
    RequestTimeout { outstanding: usize, timeout: Duration },

    /// Undersized or structurally invalid response.
    #[error("malformed response: {0}")]
    Format(String),

    /// Response checksum mismatch.
    #[error("CRC mismatch: frame carries {expected:04x}, computed {computed:04x}")]
    Integrity { expected: u16, computed: u16 },

    /// Response content does not match what was sent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Arguments cannot be expressed as a request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The MQTT client failed to hand a packet to the connection.
    #[error("MQTT transport error: {0}")]
    Transport(String),

    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] saj_common::Error),
}

impl SajError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Whether the error is a time-bound failure worth re-polling after.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::ConnectionTimeout(_)
        )
    }
}

impl From<FrameError> for SajError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Format(msg) => Self::Format(msg),
            FrameError::Integrity { expected, computed } => Self::Integrity { expected, computed },
            FrameError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

impl From<rumqttc::ClientError> for SajError {
    fn from(err: rumqttc::ClientError) -> Self {
        Self::Transport(err.to_string())
    }
}
