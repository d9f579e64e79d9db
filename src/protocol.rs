//! Wire format of the realtime call endpoint.
//!
//! Inbound frames are UTF-8 JSON `{"type": ..., "data"?: string}`; outbound
//! frames are raw PCM16 little-endian binary with no envelope.

use serde::Deserialize;
use url::Url;

use crate::error::CallError;

/// Normal closure. Never triggers a reconnect.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Server rejected the session (bad or expired token).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Streaming text of what the user said.
    InputTranscript(String),
    /// Streaming text of what the assistant is saying.
    OutputTranscript(String),
    /// Base64 PCM16 at the receive sample rate.
    Audio(String),
    TurnComplete,
    /// The user barged in; flush playback.
    Interrupt,
    /// Tag this client does not know about.
    Unknown(String),
}

// Raw envelope. `data` is only meaningful for the text-carrying tags and is
// coerced to a string the same way for all of them.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl Envelope {
    fn data_string(self) -> String {
        match self.data {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s,
            Some(other) => other.to_string(),
        }
    }
}

impl ServerMessage {
    /// Parse one inbound text frame.
    ///
    /// A frame that is not JSON (or has no `type`) is an error; an unknown
    /// `type` is not, it comes back as [`ServerMessage::Unknown`].
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let msg = match envelope.msg_type.as_str() {
            "input_transcript" => Self::InputTranscript(envelope.data_string()),
            "output_transcript" => Self::OutputTranscript(envelope.data_string()),
            "audio" => Self::Audio(envelope.data_string()),
            "turn_complete" => Self::TurnComplete,
            "interrupt" => Self::Interrupt,
            _ => Self::Unknown(envelope.msg_type),
        };
        Ok(msg)
    }
}

/// `{scheme}://{host}{path}`, `wss` when `secure`.
///
/// `host` may come from an HTTP-style base URL; a leading `http://` or
/// `https://` is stripped.
pub fn endpoint_url(host: &str, path: &str, secure: bool) -> Result<Url, CallError> {
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
        .trim_end_matches('/');
    let scheme = if secure { "wss" } else { "ws" };
    Ok(Url::parse(&format!("{}://{}{}", scheme, host, path))?)
}

/// Session URL with the access token appended as `?token=`.
pub fn session_url(endpoint: &Url, token: Option<&str>) -> Url {
    let mut url = endpoint.clone();
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    url
}
