//! ALSA PCM devices for the call: a float capture stream for the microphone
//! and a scheduled-playback output with its own render thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::pcm::float_to_pcm16;
use super::play::{AudioOutput, OutputDevice, PlaybackEvent, SourceId};
use super::record::{CaptureDevice, CaptureStream};
use crate::error::CallError;

const EPERM: i32 = 1;
const ENOENT: i32 = 2;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    format: Format,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams), alsa::Error> {
    let pcm = PCM::new(device, direction, false)?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(format)?;
        hwp.set_channels(channels)?;
        hwp.set_rate(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {:?}: device={}, rate={}, channels={}, period_size={}",
        direction,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

fn map_open_error(device: &str, e: alsa::Error) -> CallError {
    let msg = format!("{}: {}", device, e);
    match e.errno() {
        EACCES | EPERM => CallError::PermissionDenied(msg),
        ENOENT | EBUSY => CallError::DeviceUnavailable(msg),
        _ => CallError::Device(msg),
    }
}

// ======================== Capture ========================

pub struct AlsaCapture {
    device: String,
}

impl AlsaCapture {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

struct AlsaCaptureStream {
    pcm: PCM,
}

#[async_trait]
impl CaptureDevice for AlsaCapture {
    async fn open(
        &self,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Box<dyn CaptureStream>, CallError> {
        let device = self.device.clone();
        let opened = tokio::task::spawn_blocking(move || {
            open_pcm(
                &device,
                Direction::Capture,
                Format::FloatLE,
                sample_rate,
                1,
                Some(block_size),
            )
            .map_err(|e| map_open_error(&device, e))
        })
        .await
        .map_err(|e| CallError::Device(e.to_string()))?;

        let (pcm, _params) = opened?;
        pcm.start()
            .map_err(|e| CallError::Device(format!("failed to start capture: {}", e)))?;
        Ok(Box::new(AlsaCaptureStream { pcm }))
    }
}

impl CaptureStream for AlsaCaptureStream {
    fn read_block(&mut self, buf: &mut [f32]) -> Result<usize> {
        let io = self.pcm.io_f32()?;
        let mut filled = 0;
        while filled < buf.len() {
            match io.readi(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    self.pcm
                        .prepare()
                        .context("Failed to recover PCM capture")?;
                }
            }
        }
        Ok(filled)
    }
}

// ======================== Playback ========================

pub struct AlsaPlayback {
    device: String,
    period_size: usize,
}

impl AlsaPlayback {
    pub fn new(device: impl Into<String>, period_size: usize) -> Self {
        Self {
            device: device.into(),
            period_size,
        }
    }
}

#[async_trait]
impl OutputDevice for AlsaPlayback {
    async fn open(
        &self,
        sample_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Box<dyn AudioOutput>, CallError> {
        let device = self.device.clone();
        let period_size_opt = if self.period_size > 0 {
            Some(self.period_size)
        } else {
            None
        };

        let output = tokio::task::spawn_blocking(move || {
            let (pcm, params) = open_pcm(
                &device,
                Direction::Playback,
                Format::S16LE,
                sample_rate,
                1,
                period_size_opt,
            )
            .map_err(|e| map_open_error(&device, e))?;

            if params.sample_rate != sample_rate {
                return Err(CallError::DeviceUnavailable(format!(
                    "{} cannot play at {}Hz (got {}Hz)",
                    device, sample_rate, params.sample_rate
                )));
            }

            AlsaOutput::start(pcm, params, events).map_err(|e| CallError::Device(e.to_string()))
        })
        .await
        .map_err(|e| CallError::Device(e.to_string()))??;

        Ok(Box::new(output))
    }
}

struct Scheduled {
    id: SourceId,
    start_frame: u64,
    samples: Arc<[f32]>,
    /// `Ended` already sent; the tail may still be rendering.
    reported: bool,
}

impl Scheduled {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Render-thread view of what is scheduled where.
#[derive(Default)]
struct Timeline {
    sources: Vec<Scheduled>,
    /// First frame not yet claimed by the render thread.
    position: u64,
    dead: bool,
}

impl Timeline {
    /// Mix the next `mix.len()` frames and claim them.
    ///
    /// Returns the ids of sources that end before the following period is
    /// done, one period ahead of time, so whoever is waiting for them can
    /// schedule a follow-up at their end frame before it is rendered.
    fn render(&mut self, mix: &mut [f32]) -> Vec<SourceId> {
        mix.fill(0.0);
        let period = mix.len() as u64;
        let from = self.position;
        let to = from + period;
        let mut ending = Vec::new();

        for src in &mut self.sources {
            let end = src.end_frame();
            let lo = src.start_frame.max(from);
            let hi = end.min(to);
            for frame in lo..hi {
                mix[(frame - from) as usize] += src.samples[(frame - src.start_frame) as usize];
            }
            if !src.reported && end <= to + period {
                src.reported = true;
                ending.push(src.id);
            }
        }

        self.sources.retain(|s| s.end_frame() > to);
        self.position = to;
        ending
    }
}

/// An open playback PCM plus the thread feeding it.
///
/// The clock is the number of frames handed to ALSA, so it keeps running
/// (rendering silence) while nothing is scheduled.
pub struct AlsaOutput {
    sample_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutput {
    fn start(
        pcm: PCM,
        params: AlsaParams,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let running = Arc::new(AtomicBool::new(true));
        let sample_rate = params.sample_rate;

        let handle = {
            let timeline = timeline.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    if let Err(e) = play_thread(&pcm, &params, &timeline, &running, &events) {
                        log::error!("Playback thread error: {}", e);
                    }
                    // Whatever was still scheduled will never finish.
                    let mut tl = lock(&timeline);
                    tl.dead = true;
                    for src in tl.sources.drain(..).filter(|s| !s.reported) {
                        let _ = events.send(PlaybackEvent::Failed(
                            src.id,
                            "playback device stopped".into(),
                        ));
                    }
                })?
        };

        Ok(Self {
            sample_rate,
            timeline,
            running,
            handle: Some(handle),
        })
    }
}

fn lock(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AudioOutput for AlsaOutput {
    fn current_time(&self) -> f64 {
        lock(&self.timeline).position as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, id: SourceId, samples: Arc<[f32]>, start_at: f64) -> Result<()> {
        let mut tl = lock(&self.timeline);
        if tl.dead {
            anyhow::bail!("playback device stopped");
        }
        // Frames before `position` are already mixed; never start there.
        let start_frame = ((start_at * self.sample_rate as f64).round() as u64).max(tl.position);
        tl.sources.push(Scheduled {
            id,
            start_frame,
            samples,
            reported: false,
        });
        Ok(())
    }

    fn stop_all(&mut self) -> Result<()> {
        lock(&self.timeline).sources.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        lock(&self.timeline).dead
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn play_thread(
    pcm: &PCM,
    params: &AlsaParams,
    timeline: &Mutex<Timeline>,
    running: &AtomicBool,
    events: &mpsc::UnboundedSender<PlaybackEvent>,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;
    let period = params.period_size.max(1);

    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period * channels];

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period,
    );

    while running.load(Ordering::Relaxed) {
        let ending = lock(timeline).render(&mut mix);
        for id in ending {
            let _ = events.send(PlaybackEvent::Ended(id));
        }

        for (i, s) in mix.iter().enumerate() {
            let v = float_to_pcm16(*s);
            out[i * channels..(i + 1) * channels].fill(v);
        }

        // Write with retry to handle short writes and XRUN recovery.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().context("Failed to recover PCM playback")?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }
    }

    // Stopping means silence now: discard what the hardware still holds.
    let _ = pcm.drop();
    log::info!("Playback stopped");
    Ok(())
}
