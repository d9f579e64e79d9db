//! Error types surfaced by the call pipeline.

use thiserror::Error;

/// Failures a caller has to branch on.
///
/// Transport-level trouble (abnormal closes, socket errors) is not an error
/// here: it is reported as [`crate::net_link::NetEvent`]s and recovered by the
/// reconnect policy.
#[derive(Error, Debug)]
pub enum CallError {
    /// No access token available, a call cannot be placed.
    #[error("access token missing")]
    TokenMissing,

    /// The OS refused access to the microphone or speaker.
    #[error("audio device permission denied: {0}")]
    PermissionDenied(String),

    /// No such device, or it is held by someone else.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Runtime failure of an already opened device.
    #[error("audio device error: {0}")]
    Device(String),

    /// Inbound audio payload could not be decoded.
    #[error("audio decode error: {0}")]
    Decode(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<base64::DecodeError> for CallError {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<url::ParseError> for CallError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidEndpoint(e.to_string())
    }
}
