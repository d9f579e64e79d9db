//! Streaming transcript accumulation.
//!
//! Transcript deltas arrive in small pieces per speaker. Consecutive deltas of
//! one speaker are merged into a single entry until the turn is finalized,
//! either by a `turn_complete` from the server or by the other side starting
//! to speak.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub final_: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, speaker: Speaker, delta: &str) {
        if let Some(last) = self.entries.last_mut() {
            if last.speaker == speaker && !last.final_ {
                last.text.push_str(delta);
                return;
            }
            // Nothing can be appended to it anymore.
            last.final_ = true;
        }
        self.entries.push(TranscriptEntry {
            speaker,
            text: delta.to_string(),
            final_: false,
        });
    }

    pub fn finalize_last(&mut self) {
        if let Some(last) = self.entries.last_mut() {
            last.final_ = true;
        }
    }
}
