//! Jitter-buffered playback of streamed PCM16 chunks.
//!
//! Chunks are decoded on arrival and queued. Only one chunk is handed to the
//! output at a time; when it finishes the next one is scheduled to start at
//! the watermark left by the previous one, or at the output clock if playback
//! has fallen behind.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::pcm::decode_pcm16_base64;
use crate::error::CallError;

pub type SourceId = u64;

/// Completion reports from the output device.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Ended(SourceId),
    Failed(SourceId, String),
}

/// Opens the output device. Kept separate from [`AudioOutput`] so the player
/// can reopen the device after `stop()` or after the device was lost.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    async fn open(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, CallError>;
}

/// An open output with its own clock, able to play mono buffers at given
/// points on that clock.
pub trait AudioOutput: Send {
    /// Seconds since the output was opened.
    fn current_time(&self) -> f64;

    /// Play `samples` starting at `start_at` (output clock seconds). Must
    /// eventually report `Ended(id)` or `Failed(id, ..)` unless stopped.
    /// `Ended` may arrive up to one device period before the last sample is
    /// heard, early enough to schedule the next buffer right behind it.
    fn schedule(&mut self, id: SourceId, samples: Arc<[f32]>, start_at: f64)
    -> anyhow::Result<()>;

    /// Silence everything scheduled or still sounding.
    fn stop_all(&mut self) -> anyhow::Result<()>;

    /// The device went away; this output will never play again.
    fn is_closed(&self) -> bool;

    /// Release the device.
    fn close(&mut self);
}

pub struct StreamingPlayer {
    device: Arc<dyn OutputDevice>,
    sample_rate: u32,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    output: Option<Box<dyn AudioOutput>>,
    queue: VecDeque<Vec<f32>>,
    is_playing: bool,
    next_play_time: f64,
    active: Vec<SourceId>,
    next_id: SourceId,
}

impl StreamingPlayer {
    pub fn new(
        device: Arc<dyn OutputDevice>,
        sample_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        Self {
            device,
            sample_rate,
            events,
            output: None,
            queue: VecDeque::new(),
            is_playing: false,
            next_play_time: 0.0,
            active: Vec::new(),
            next_id: 0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn active_sources(&self) -> &[SourceId] {
        &self.active
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    /// Decode one base64 chunk and queue it. Kicks off playback when idle.
    pub async fn receive_audio(&mut self, base64_chunk: &str) -> Result<(), CallError> {
        let samples = decode_pcm16_base64(base64_chunk)?;
        self.ensure_output().await?;
        if samples.is_empty() {
            return Ok(());
        }
        self.queue.push_back(samples);

        if !self.is_playing {
            self.is_playing = true;
            self.schedule_next();
        }
        Ok(())
    }

    /// Feed a completion report from the output device. Fails only if the
    /// device was lost and cannot be reopened.
    pub async fn handle_event(&mut self, event: PlaybackEvent) -> Result<(), CallError> {
        let id = match &event {
            PlaybackEvent::Ended(id) => *id,
            PlaybackEvent::Failed(id, reason) => {
                log::error!("Playback source {} failed: {}", id, reason);
                *id
            }
        };
        // Reports for sources already stopped by an interrupt are stale.
        let Some(pos) = self.active.iter().position(|a| *a == id) else {
            return Ok(());
        };
        self.active.remove(pos);

        if self.is_playing {
            if let Err(e) = self.ensure_output().await {
                self.is_playing = false;
                self.queue.clear();
                return Err(e);
            }
            self.schedule_next();
        }
        Ok(())
    }

    /// Barge-in: silence everything now and forget what is queued.
    pub fn interrupt(&mut self) {
        if !self.queue.is_empty() || !self.active.is_empty() {
            log::info!(
                "Interrupting playback: {} queued, {} active",
                self.queue.len(),
                self.active.len()
            );
        }
        self.is_playing = false;
        self.queue.clear();
        self.active.clear();

        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.stop_all() {
                log::error!("Failed to silence playback: {}", e);
            }
            self.next_play_time = output.current_time();
        }
    }

    /// Interrupt and release the output device. Idempotent.
    pub fn stop(&mut self) {
        self.interrupt();
        if let Some(mut output) = self.output.take() {
            output.close();
            log::info!("Playback output closed");
        }
    }

    async fn ensure_output(&mut self) -> Result<(), CallError> {
        if self.output.as_ref().is_some_and(|o| o.is_closed()) {
            log::warn!("Playback output lost, reopening");
            if let Some(mut dead) = self.output.take() {
                dead.close();
            }
            // Reports still coming from the dead output are stale.
            self.active.clear();
        }
        if self.output.is_none() {
            let output = self
                .device
                .open(self.sample_rate, self.events.clone())
                .await?;
            self.next_play_time = output.current_time();
            self.output = Some(output);
        }
        Ok(())
    }

    fn schedule_next(&mut self) {
        let Some(output) = self.output.as_mut() else {
            self.is_playing = false;
            return;
        };

        // A chunk the device refuses is skipped like a chunk that failed
        // while playing.
        while let Some(chunk) = self.queue.pop_front() {
            let now = output.current_time();
            let start = if self.next_play_time < now {
                now
            } else {
                self.next_play_time
            };
            let duration = chunk.len() as f64 / self.sample_rate as f64;
            let id = self.next_id;
            self.next_id += 1;

            match output.schedule(id, chunk.into(), start) {
                Ok(()) => {
                    self.next_play_time = start + duration;
                    self.active.push(id);
                    return;
                }
                Err(e) => {
                    log::error!("Failed to schedule playback chunk: {}", e);
                }
            }
        }

        self.is_playing = false;
    }
}

impl Drop for StreamingPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct FakeOutputState {
        pub now: f64,
        /// (id, samples, start_at)
        pub scheduled: Vec<(SourceId, usize, f64)>,
        pub flushed: usize,
        pub opened: usize,
        pub closed: usize,
        pub reject_schedule: bool,
        pub reject_open: bool,
        /// Simulates a lost device; cleared when the device is reopened.
        pub dead: bool,
    }

    /// Output device whose clock only moves when a test moves it.
    #[derive(Clone, Default)]
    pub(crate) struct FakeSpeaker {
        pub state: Arc<Mutex<FakeOutputState>>,
    }

    struct FakeOutput {
        state: Arc<Mutex<FakeOutputState>>,
    }

    #[async_trait]
    impl OutputDevice for FakeSpeaker {
        async fn open(
            &self,
            _sample_rate: u32,
            _events: mpsc::UnboundedSender<PlaybackEvent>,
        ) -> Result<Box<dyn AudioOutput>, CallError> {
            let mut state = self.state.lock().unwrap();
            if state.reject_open {
                return Err(CallError::DeviceUnavailable("unplugged".into()));
            }
            state.opened += 1;
            state.dead = false;
            Ok(Box::new(FakeOutput {
                state: self.state.clone(),
            }))
        }
    }

    impl AudioOutput for FakeOutput {
        fn current_time(&self) -> f64 {
            self.state.lock().unwrap().now
        }

        fn schedule(
            &mut self,
            id: SourceId,
            samples: Arc<[f32]>,
            start_at: f64,
        ) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.reject_schedule || state.dead {
                anyhow::bail!("rejected by test");
            }
            state.scheduled.push((id, samples.len(), start_at));
            Ok(())
        }

        fn stop_all(&mut self) -> anyhow::Result<()> {
            self.state.lock().unwrap().flushed += 1;
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.state.lock().unwrap().dead
        }

        fn close(&mut self) {
            self.state.lock().unwrap().closed += 1;
        }
    }

    /// Base64 of `n` samples of silence.
    pub(crate) fn chunk(n: usize) -> String {
        STANDARD.encode(vec![0u8; n * 2])
    }

    fn player(speaker: &FakeSpeaker) -> StreamingPlayer {
        let (tx, _rx) = mpsc::unbounded_channel();
        StreamingPlayer::new(Arc::new(speaker.clone()), 1000, tx)
    }

    #[tokio::test]
    async fn chunks_play_back_to_back() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.receive_audio(&chunk(500)).await.unwrap();
        p.receive_audio(&chunk(250)).await.unwrap();
        assert!(p.is_playing());
        assert_eq!(p.queued(), 1);
        assert_eq!(p.next_play_time(), 0.5);

        // First chunk ends on time, the second starts exactly at the watermark.
        speaker.state.lock().unwrap().now = 0.5;
        p.handle_event(PlaybackEvent::Ended(0)).await.unwrap();
        assert_eq!(p.next_play_time(), 0.75);
        {
            let state = speaker.state.lock().unwrap();
            assert_eq!(state.scheduled, vec![(0, 500, 0.0), (1, 250, 0.5)]);
        }

        speaker.state.lock().unwrap().now = 0.75;
        p.handle_event(PlaybackEvent::Ended(1)).await.unwrap();
        assert!(!p.is_playing());
        assert!(p.active_sources().is_empty());
    }

    #[tokio::test]
    async fn early_completion_still_starts_at_watermark() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.receive_audio(&chunk(500)).await.unwrap();
        p.receive_audio(&chunk(250)).await.unwrap();

        // Device reports the first chunk done while its tail is still playing.
        speaker.state.lock().unwrap().now = 0.45;
        p.handle_event(PlaybackEvent::Ended(0)).await.unwrap();
        assert_eq!(
            speaker.state.lock().unwrap().scheduled.last(),
            Some(&(1, 250, 0.5))
        );
    }

    #[tokio::test]
    async fn underrun_anchors_to_now() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.receive_audio(&chunk(100)).await.unwrap();
        speaker.state.lock().unwrap().now = 0.1;
        p.handle_event(PlaybackEvent::Ended(0)).await.unwrap();
        assert!(!p.is_playing());

        // Nothing arrived for a while.
        speaker.state.lock().unwrap().now = 2.0;
        p.receive_audio(&chunk(100)).await.unwrap();
        let state = speaker.state.lock().unwrap();
        assert_eq!(state.scheduled.last(), Some(&(1, 100, 2.0)));
        drop(state);
        assert!((p.next_play_time() - 2.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn watermark_never_goes_backwards_while_playing() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);
        let mut last = p.next_play_time();

        for i in 0..10u64 {
            p.receive_audio(&chunk(10 + i as usize * 7)).await.unwrap();
            assert!(p.next_play_time() >= last);
            last = p.next_play_time();
            speaker.state.lock().unwrap().now += 0.005;
            if let Some(id) = p.active_sources().first().copied() {
                p.handle_event(PlaybackEvent::Ended(id)).await.unwrap();
            }
            assert!(p.next_play_time() >= last);
            last = p.next_play_time();
        }
    }

    #[tokio::test]
    async fn interrupt_clears_queue_and_silences_output() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        for _ in 0..5 {
            p.receive_audio(&chunk(100)).await.unwrap();
        }
        assert_eq!(p.queued(), 4);
        speaker.state.lock().unwrap().now = 0.03;

        p.interrupt();
        assert_eq!(p.queued(), 0);
        assert!(p.active_sources().is_empty());
        assert!(!p.is_playing());
        assert_eq!(p.next_play_time(), 0.03);
        assert_eq!(speaker.state.lock().unwrap().flushed, 1);

        // The stopped source's late completion must not restart anything.
        p.handle_event(PlaybackEvent::Ended(0)).await.unwrap();
        assert_eq!(speaker.state.lock().unwrap().scheduled.len(), 1);
    }

    #[tokio::test]
    async fn failed_chunk_moves_on_to_next() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.receive_audio(&chunk(100)).await.unwrap();
        p.receive_audio(&chunk(100)).await.unwrap();
        p.handle_event(PlaybackEvent::Failed(0, "node error".into()))
            .await
            .unwrap();

        assert!(p.is_playing());
        assert_eq!(p.active_sources(), &[1]);
    }

    #[tokio::test]
    async fn rejected_schedule_skips_chunk() {
        let speaker = FakeSpeaker::default();
        speaker.state.lock().unwrap().reject_schedule = true;
        let mut p = player(&speaker);

        p.receive_audio(&chunk(100)).await.unwrap();
        assert!(!p.is_playing());
        assert_eq!(p.queued(), 0);
    }

    #[tokio::test]
    async fn bad_payload_leaves_queue_untouched() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);
        p.receive_audio(&chunk(100)).await.unwrap();
        p.receive_audio(&chunk(100)).await.unwrap();

        assert!(p.receive_audio("@@@").await.is_err());
        assert_eq!(p.queued(), 1);
    }

    #[tokio::test]
    async fn lost_output_is_reopened_for_the_next_chunk() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.receive_audio(&chunk(100)).await.unwrap();
        p.receive_audio(&chunk(100)).await.unwrap();
        speaker.state.lock().unwrap().dead = true;

        p.handle_event(PlaybackEvent::Failed(0, "device stopped".into()))
            .await
            .unwrap();
        {
            let state = speaker.state.lock().unwrap();
            assert_eq!(state.opened, 2);
            assert_eq!(state.closed, 1);
            assert_eq!(state.scheduled.last(), Some(&(1, 100, 0.0)));
        }
        assert_eq!(p.active_sources(), &[1]);
    }

    #[tokio::test]
    async fn lost_output_that_cannot_reopen_is_an_error() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.receive_audio(&chunk(100)).await.unwrap();
        p.receive_audio(&chunk(100)).await.unwrap();
        {
            let mut state = speaker.state.lock().unwrap();
            state.dead = true;
            state.reject_open = true;
        }

        let err = p
            .handle_event(PlaybackEvent::Failed(0, "device stopped".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::DeviceUnavailable(_)));
        assert!(!p.is_playing());
        assert_eq!(p.queued(), 0);

        assert!(p.receive_audio(&chunk(100)).await.is_err());
    }

    #[tokio::test]
    async fn stop_twice_closes_once_and_reopens_on_demand() {
        let speaker = FakeSpeaker::default();
        let mut p = player(&speaker);

        p.stop();
        assert_eq!(speaker.state.lock().unwrap().closed, 0);

        p.receive_audio(&chunk(100)).await.unwrap();
        p.stop();
        p.stop();
        {
            let state = speaker.state.lock().unwrap();
            assert_eq!(state.opened, 1);
            assert_eq!(state.closed, 1);
        }

        p.receive_audio(&chunk(100)).await.unwrap();
        assert_eq!(speaker.state.lock().unwrap().opened, 2);
        drop(p);
        assert_eq!(speaker.state.lock().unwrap().closed, 2);
    }
}
