//! audio - microphone capture, streamed playback and PCM16 conversion
//!
//! Device access goes through the [`CaptureDevice`] and [`OutputDevice`]
//! traits; the ALSA implementations live in `alsa_device` and run their
//! realtime I/O on dedicated OS threads.

#[cfg(feature = "alsa")]
mod alsa_device;
pub mod pcm;
pub mod play;
pub mod record;

#[cfg(feature = "alsa")]
pub use alsa_device::{AlsaCapture, AlsaPlayback};
pub use pcm::VoiceActivity;
pub use play::{AudioOutput, OutputDevice, PlaybackEvent, SourceId, StreamingPlayer};
pub use record::{CaptureDevice, CaptureFrame, CaptureStream, Microphone};
