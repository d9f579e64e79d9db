//! carecall - realtime voice call client
//!
//! Streams microphone PCM16 to a realtime voice-AI WebSocket server, plays
//! the streamed reply audio gaplessly and keeps a live two-party transcript.

pub mod audio;
pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod transcript;

pub use config::Config;
pub use controller::{CallCommand, CallController, CallDevices, CallState, CallStatus, CallView};
pub use error::CallError;
pub use net_link::{ConnectionState, NetEvent, NetHandle, NetLink, ReconnectPolicy};
pub use protocol::ServerMessage;
pub use transcript::{Speaker, Transcript, TranscriptEntry};
