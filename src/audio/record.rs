use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::pcm::{VoiceActivity, encode_pcm16};
use crate::error::CallError;

/// One captured block, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// PCM16 LE mono at the send sample rate.
    pub pcm: Bytes,
    /// Block level on a 0..=255 scale, see [`VoiceActivity::level`].
    pub level: u8,
}

/// Something that can hand out a microphone stream.
///
/// `open` is where the OS may ask for permission, so it is the one await
/// point of the capture side.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(
        &self,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Box<dyn CaptureStream>, CallError>;
}

/// An open microphone. Dropping it releases the device.
pub trait CaptureStream: Send {
    /// Block until `buf` is filled with mono float samples in [-1, 1].
    /// Returns the number of samples written.
    fn read_block(&mut self, buf: &mut [f32]) -> anyhow::Result<usize>;
}

/// Microphone → PCM16 frames → sink channel.
///
/// A capture thread that dies on its own (device unplugged, read error)
/// reports on `failures`; a stopped one does not.
pub struct Microphone {
    device: Arc<dyn CaptureDevice>,
    sample_rate: u32,
    block_size: usize,
    sink: mpsc::Sender<CaptureFrame>,
    failures: mpsc::UnboundedSender<CallError>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    releasing: Option<tokio::task::JoinHandle<()>>,
}

impl Microphone {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        sample_rate: u32,
        block_size: usize,
        sink: mpsc::Sender<CaptureFrame>,
        failures: mpsc::UnboundedSender<CallError>,
    ) -> Self {
        Self {
            device,
            sample_rate,
            block_size,
            sink,
            failures,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            releasing: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Acquire the microphone and start pushing frames into the sink.
    ///
    /// Device errors are returned to the caller. Calling `start` on a running
    /// microphone does nothing.
    pub async fn start(&mut self) -> Result<(), CallError> {
        if self.is_running() {
            return Ok(());
        }
        // Reap a thread that died on its own, and make sure the previous
        // stream has let go of the device before opening it again.
        self.stop();
        self.released().await;

        let stream = self.device.open(self.sample_rate, self.block_size).await?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let sink = self.sink.clone();
        let failures = self.failures.clone();
        let block_size = self.block_size;

        let handle = thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || {
                if let Err(e) = record_thread(stream, block_size, sink, &running) {
                    log::error!("Recording thread error: {}", e);
                    if running.swap(false, Ordering::SeqCst) {
                        let err = CallError::Device(format!("capture stopped: {}", e));
                        let _ = failures.send(err);
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| CallError::Device(e.to_string()))?;

        log::info!(
            "Microphone started: rate={}, block={}",
            self.sample_rate,
            self.block_size
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop capturing. Safe to call any number of times, including before
    /// `start`.
    ///
    /// The thread exits after its current block, dropping the stream. Inside
    /// a runtime that wait happens on the blocking pool; see [`released`].
    ///
    /// [`released`]: Microphone::released
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    self.releasing = Some(rt.spawn_blocking(move || {
                        let _ = h.join();
                    }));
                }
                Err(_) => {
                    let _ = h.join();
                }
            }
            log::info!("Microphone stopped");
        }
    }

    /// Wait until the last stopped capture thread has released the device.
    pub async fn released(&mut self) {
        if let Some(r) = self.releasing.take() {
            let _ = r.await;
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_thread(
    mut stream: Box<dyn CaptureStream>,
    block_size: usize,
    sink: mpsc::Sender<CaptureFrame>,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut block = vec![0f32; block_size];
    let mut dropped = 0u64;

    while running.load(Ordering::Relaxed) {
        let n = stream.read_block(&mut block)?;
        if n == 0 {
            continue;
        }
        let samples = &block[..n];
        let frame = CaptureFrame {
            pcm: encode_pcm16(samples),
            level: VoiceActivity::level(samples),
        };

        match sink.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Realtime: a stale frame is worth less than no frame.
                dropped += 1;
                if dropped % 50 == 1 {
                    log::warn!("Capture sink full, {} frames dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Capture sink closed, receiver dropped");
                break;
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}
