use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::audio::{
    CaptureDevice, CaptureFrame, Microphone, OutputDevice, PlaybackEvent, StreamingPlayer,
    VoiceActivity,
};
use crate::auth::TokenSource;
use crate::config::Config;
use crate::error::CallError;
use crate::net_link::{NetEvent, NetHandle, NetLink, ReconnectPolicy};
use crate::protocol::{
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, ServerMessage, endpoint_url,
};
use crate::transcript::{Speaker, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Active,
    Ended,
}

/// What the call screen shows in its status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Preparing,
    CheckingToken,
    TokenMissing,
    InvalidEndpoint,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, max_attempts: u32 },
    ConnectionLost,
    AuthRejected,
    ServerError,
    SocketError,
    PermissionDenied,
    DeviceFailed,
    Ended,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing connection..."),
            Self::CheckingToken => write!(f, "checking access token..."),
            Self::TokenMissing => write!(f, "token missing"),
            Self::InvalidEndpoint => write!(f, "invalid server address"),
            Self::Connecting => write!(f, "connecting..."),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => write!(
                f,
                "connection lost, reconnecting ({}/{})...",
                attempt, max_attempts
            ),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::AuthRejected => write!(f, "authentication failed"),
            Self::ServerError => write!(f, "server error"),
            Self::SocketError => write!(f, "websocket error"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::DeviceFailed => write!(f, "audio device error"),
            Self::Ended => write!(f, "call ended"),
        }
    }
}

/// Snapshot of everything the call screen renders.
#[derive(Debug, Clone, PartialEq)]
pub struct CallView {
    pub state: CallState,
    pub status: CallStatus,
    pub transcript: Transcript,
    pub duration_secs: u64,
    pub speaking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    End,
}

/// Audio devices a call runs on. The controller owns both for the lifetime
/// of the call and releases them on every exit path.
pub struct CallDevices {
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputDevice>,
}

pub struct CallController {
    call_id: Uuid,
    config: Config,
    token_source: Arc<dyn TokenSource>,
    state: CallState,
    status: CallStatus,
    transcript: Transcript,
    duration_secs: u64,
    vad: VoiceActivity,
    net: Option<NetHandle>,
    microphone: Microphone,
    player: StreamingPlayer,
    view_tx: watch::Sender<CallView>,
    net_tx: mpsc::Sender<NetEvent>,
    net_rx: mpsc::Receiver<NetEvent>,
    capture_rx: mpsc::Receiver<CaptureFrame>,
    capture_fail_rx: mpsc::UnboundedReceiver<CallError>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
}

impl CallController {
    pub fn new(
        config: Config,
        token_source: Arc<dyn TokenSource>,
        devices: CallDevices,
    ) -> (Self, watch::Receiver<CallView>) {
        let (net_tx, net_rx) = mpsc::channel(100);
        let (capture_tx, capture_rx) = mpsc::channel(16);
        let (capture_fail_tx, capture_fail_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let microphone = Microphone::new(
            devices.capture,
            config.send_sample_rate,
            config.capture_block_size,
            capture_tx,
            capture_fail_tx,
        );
        let player = StreamingPlayer::new(devices.output, config.receive_sample_rate, playback_tx);

        let (view_tx, view_rx) = watch::channel(CallView {
            state: CallState::Idle,
            status: CallStatus::Preparing,
            transcript: Transcript::new(),
            duration_secs: 0,
            speaking: false,
        });

        let controller = Self {
            call_id: Uuid::new_v4(),
            vad: VoiceActivity::new(config.speaking_threshold),
            config,
            token_source,
            state: CallState::Idle,
            status: CallStatus::Preparing,
            transcript: Transcript::new(),
            duration_secs: 0,
            net: None,
            microphone,
            player,
            view_tx,
            net_tx,
            net_rx,
            capture_rx,
            capture_fail_rx,
            playback_rx,
        };
        (controller, view_rx)
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn status(&self) -> &CallStatus {
        &self.status
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn view(&self) -> CallView {
        CallView {
            state: self.state,
            status: self.status.clone(),
            transcript: self.transcript.clone(),
            duration_secs: self.duration_secs,
            speaking: self.vad.is_speaking(),
        }
    }

    /// Check the token and spawn the transport. Without a token the call
    /// ends right here and nothing is connected.
    pub fn start(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            return Ok(());
        }
        self.set_status(CallStatus::CheckingToken);

        let Some(token) = self.token_source.access_token() else {
            log::warn!("[{}] No access token, not connecting", self.call_id);
            self.state = CallState::Ended;
            self.set_status(CallStatus::TokenMissing);
            return Err(CallError::TokenMissing);
        };

        let endpoint = match endpoint_url(
            &self.config.ws_host,
            &self.config.ws_path,
            self.config.ws_secure,
        ) {
            Ok(url) => url,
            Err(e) => {
                log::error!("[{}] {}", self.call_id, e);
                self.state = CallState::Ended;
                self.set_status(CallStatus::InvalidEndpoint);
                return Err(e);
            }
        };

        let policy = ReconnectPolicy::new(
            self.config.reconnect_max_attempts,
            self.config.reconnect_base_delay,
        );
        let (link, handle) = NetLink::new(endpoint, Some(token), policy, self.net_tx.clone());
        tokio::spawn(link.run());
        self.net = Some(handle);

        log::info!("[{}] Call starting", self.call_id);
        self.state = CallState::Connecting;
        self.set_status(CallStatus::Connecting);
        Ok(())
    }

    /// Drive the call until it ends. `commands` closing counts as hanging
    /// up (the screen went away).
    pub async fn run(mut self, mut commands: mpsc::Receiver<CallCommand>) -> CallView {
        if self.start().is_err() {
            return self.view();
        }

        let second = Duration::from_secs(1);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + second, second);

        while self.state != CallState::Ended {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(CallCommand::End) | None => self.end_call(),
                    }
                }
                Some(event) = self.net_rx.recv() => self.handle_net_event(event).await,
                Some(frame) = self.capture_rx.recv() => self.handle_capture_frame(frame),
                Some(err) = self.capture_fail_rx.recv() => self.handle_capture_failure(err),
                Some(event) = self.playback_rx.recv() => {
                    if let Err(e) = self.player.handle_event(event).await {
                        self.device_failed("Playback device lost", e);
                    }
                }
                _ = ticker.tick() => {
                    if self.state == CallState::Active {
                        self.duration_secs += 1;
                        self.publish();
                    }
                }
            }
        }

        self.teardown();
        self.microphone.released().await;
        log::info!(
            "[{}] Call finished after {}s: {}",
            self.call_id,
            self.duration_secs,
            self.status
        );
        self.view()
    }

    pub async fn handle_net_event(&mut self, event: NetEvent) {
        if self.state == CallState::Ended {
            return;
        }
        match event {
            NetEvent::Open => {
                log::info!("[{}] WebSocket Connected", self.call_id);
                self.state = CallState::Active;
                self.set_status(CallStatus::Connected);

                if let Err(e) = self.microphone.start().await {
                    self.device_failed("Failed to start microphone", e);
                }
            }
            NetEvent::Message(msg) => self.process_server_message(msg).await,
            NetEvent::Error(e) => {
                log::error!("[{}] WebSocket error: {}", self.call_id, e);
                self.teardown();
                self.set_status(CallStatus::SocketError);
            }
            NetEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
                code,
            } => {
                log::warn!(
                    "[{}] Connection lost (code {}), retry {}/{} in {:?}",
                    self.call_id,
                    code,
                    attempt,
                    max_attempts,
                    delay
                );
                self.teardown();
                self.state = CallState::Connecting;
                self.set_status(CallStatus::Reconnecting {
                    attempt,
                    max_attempts,
                });
            }
            NetEvent::Closed {
                code,
                reason,
                manual,
            } => {
                log::info!(
                    "[{}] WebSocket Disconnected: code={}, reason={:?}",
                    self.call_id,
                    code,
                    reason
                );
                let status = match code {
                    _ if manual => CallStatus::Ended,
                    CLOSE_NORMAL => CallStatus::Ended,
                    CLOSE_POLICY_VIOLATION => CallStatus::AuthRejected,
                    CLOSE_INTERNAL_ERROR => CallStatus::ServerError,
                    _ => CallStatus::ConnectionLost,
                };
                self.net = None;
                self.finish(status);
            }
        }
    }

    async fn process_server_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::InputTranscript(text) => {
                self.transcript.append(Speaker::User, &text);
                self.publish();
            }
            ServerMessage::OutputTranscript(text) => {
                self.transcript.append(Speaker::Ai, &text);
                self.publish();
            }
            ServerMessage::TurnComplete => {
                log::debug!("[{}] Turn complete", self.call_id);
                self.transcript.finalize_last();
                self.publish();
            }
            ServerMessage::Audio(data) => match self.player.receive_audio(&data).await {
                Ok(()) => {}
                Err(CallError::Decode(e)) => {
                    log::error!("[{}] Dropping audio chunk: {}", self.call_id, e);
                }
                Err(e) => self.device_failed("Failed to open playback", e),
            },
            ServerMessage::Interrupt => {
                log::info!("[{}] Interrupt received, flushing playback", self.call_id);
                self.player.interrupt();
            }
            ServerMessage::Unknown(tag) => {
                log::warn!("[{}] Unhandled message type: {}", self.call_id, tag);
            }
        }
    }

    pub fn handle_capture_frame(&mut self, frame: CaptureFrame) {
        if self.state != CallState::Active {
            return;
        }
        if let Some(net) = &self.net {
            net.send_audio(frame.pcm);
        }
        if self.vad.update(frame.level) {
            self.publish();
        }
    }

    /// The capture thread died on its own while the call was up.
    pub fn handle_capture_failure(&mut self, err: CallError) {
        if self.state != CallState::Active {
            return;
        }
        self.device_failed("Microphone lost", err);
    }

    fn device_failed(&mut self, what: &str, err: CallError) {
        log::error!("[{}] {}: {}", self.call_id, what, err);
        let status = match err {
            CallError::PermissionDenied(_) => CallStatus::PermissionDenied,
            _ => CallStatus::DeviceFailed,
        };
        self.finish(status);
    }

    /// Hang up: close the transport for good, then release the devices.
    /// Safe to call repeatedly and after the call already ended on its own.
    pub fn end_call(&mut self) {
        if let Some(net) = self.net.take() {
            net.close();
        }
        self.teardown();
        if self.state != CallState::Ended {
            self.state = CallState::Ended;
            self.set_status(CallStatus::Ended);
        }
    }

    fn finish(&mut self, status: CallStatus) {
        if let Some(net) = self.net.take() {
            net.close();
        }
        self.teardown();
        self.state = CallState::Ended;
        self.set_status(status);
    }

    /// Stop capture and playback. Idempotent.
    fn teardown(&mut self) {
        self.microphone.stop();
        self.player.stop();
        self.vad.reset();
    }

    fn set_status(&mut self, status: CallStatus) {
        log::info!("[{}] Status: {}", self.call_id, status);
        self.status = status;
        self.publish();
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(net) = self.net.take() {
            net.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::play::tests::{FakeSpeaker, chunk};
    use crate::audio::record::tests::FakeMic;
    use crate::auth::StaticToken;
    use crate::transcript::TranscriptEntry;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::Ordering;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    struct Harness {
        controller: CallController,
        view: watch::Receiver<CallView>,
        mic: Arc<FakeMic>,
        speaker: FakeSpeaker,
    }

    fn harness_with(token: Option<&str>, mic: FakeMic, config: Config) -> Harness {
        let mic = Arc::new(mic);
        let speaker = FakeSpeaker::default();
        let (controller, view) = CallController::new(
            config,
            Arc::new(StaticToken(token.map(str::to_string))),
            CallDevices {
                capture: mic.clone(),
                output: Arc::new(speaker.clone()),
            },
        );
        Harness {
            controller,
            view,
            mic,
            speaker,
        }
    }

    fn harness(token: Option<&str>) -> Harness {
        harness_with(
            token,
            FakeMic::new(0.0),
            Config::for_endpoint("127.0.0.1:9", "/ws/realtime", false),
        )
    }

    fn msg(m: ServerMessage) -> NetEvent {
        NetEvent::Message(m)
    }

    #[tokio::test]
    async fn missing_token_never_connects() {
        let mut h = harness(None);
        assert!(matches!(h.controller.start(), Err(CallError::TokenMissing)));
        assert_eq!(h.controller.state(), CallState::Ended);
        assert!(h.controller.net.is_none());

        let view = h.view.borrow().clone();
        assert_eq!(view.status, CallStatus::TokenMissing);
        assert_eq!(view.status.to_string(), "token missing");
    }

    #[tokio::test]
    async fn streamed_ai_turn_becomes_one_final_entry() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        for m in [
            ServerMessage::OutputTranscript("Hello".into()),
            ServerMessage::OutputTranscript(" there".into()),
            ServerMessage::TurnComplete,
        ] {
            h.controller.handle_net_event(msg(m)).await;
        }

        assert_eq!(
            h.controller.transcript().entries(),
            &[TranscriptEntry {
                speaker: Speaker::Ai,
                text: "Hello there".into(),
                final_: true,
            }]
        );
        assert_eq!(h.view.borrow().transcript, *h.controller.transcript());
        h.controller.end_call();
    }

    #[tokio::test]
    async fn reconnects_then_resumes_on_open() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        assert_eq!(h.mic.opened.load(Ordering::SeqCst), 1);

        for attempt in 1..=3 {
            h.controller
                .handle_net_event(NetEvent::Reconnecting {
                    attempt,
                    max_attempts: 5,
                    delay: Duration::from_millis(1000) * attempt,
                    code: 1006,
                })
                .await;
            assert_eq!(h.controller.state(), CallState::Connecting);
            assert!(!h.controller.microphone.is_running());
        }
        assert_eq!(
            *h.controller.status(),
            CallStatus::Reconnecting {
                attempt: 3,
                max_attempts: 5
            }
        );

        h.controller.handle_net_event(NetEvent::Open).await;
        assert_eq!(h.controller.state(), CallState::Active);
        assert_eq!(*h.controller.status(), CallStatus::Connected);
        assert_eq!(h.mic.opened.load(Ordering::SeqCst), 2);
        h.controller.end_call();
    }

    #[tokio::test]
    async fn close_codes_map_to_status() {
        for (code, manual, expected) in [
            (1000, false, CallStatus::Ended),
            (1006, false, CallStatus::ConnectionLost),
            (1008, false, CallStatus::AuthRejected),
            (1011, false, CallStatus::ServerError),
            (1006, true, CallStatus::Ended),
        ] {
            let mut h = harness(Some("t"));
            h.controller.handle_net_event(NetEvent::Open).await;
            h.controller
                .handle_net_event(NetEvent::Closed {
                    code,
                    reason: String::new(),
                    manual,
                })
                .await;
            assert_eq!(h.controller.state(), CallState::Ended);
            assert_eq!(*h.controller.status(), expected);
            assert!(!h.controller.microphone.is_running());
        }
    }

    #[tokio::test]
    async fn socket_error_tears_down_media() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        h.controller
            .handle_net_event(msg(ServerMessage::Audio(chunk(240))))
            .await;
        assert!(h.controller.player.is_playing());

        h.controller
            .handle_net_event(NetEvent::Error("reset".into()))
            .await;
        assert_eq!(*h.controller.status(), CallStatus::SocketError);
        assert!(!h.controller.microphone.is_running());
        assert!(!h.controller.player.is_playing());
        assert_eq!(h.speaker.state.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn interrupt_flushes_playback() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        for _ in 0..4 {
            h.controller
                .handle_net_event(msg(ServerMessage::Audio(chunk(240))))
                .await;
        }
        assert_eq!(h.controller.player.queued(), 3);

        h.controller
            .handle_net_event(msg(ServerMessage::Interrupt))
            .await;
        assert_eq!(h.controller.player.queued(), 0);
        assert!(h.controller.player.active_sources().is_empty());
        h.controller.end_call();
    }

    #[tokio::test]
    async fn denied_microphone_ends_the_call() {
        let mut h = harness_with(
            Some("t"),
            FakeMic::denying(),
            Config::for_endpoint("127.0.0.1:9", "/ws/realtime", false),
        );
        h.controller.handle_net_event(NetEvent::Open).await;
        assert_eq!(h.controller.state(), CallState::Ended);
        assert_eq!(*h.controller.status(), CallStatus::PermissionDenied);
    }

    #[tokio::test]
    async fn microphone_failure_mid_call_ends_it() {
        let mut h = harness_with(
            Some("t"),
            FakeMic::failing(),
            Config::for_endpoint("127.0.0.1:9", "/ws/realtime", false),
        );
        h.controller.handle_net_event(NetEvent::Open).await;
        assert_eq!(h.controller.state(), CallState::Active);

        let err = tokio::time::timeout(Duration::from_secs(2), h.controller.capture_fail_rx.recv())
            .await
            .unwrap()
            .unwrap();
        h.controller.handle_capture_failure(err);

        assert_eq!(h.controller.state(), CallState::Ended);
        assert_eq!(*h.controller.status(), CallStatus::DeviceFailed);
        assert!(!h.controller.microphone.is_running());
        assert_eq!(h.view.borrow().status, CallStatus::DeviceFailed);
    }

    #[tokio::test]
    async fn lost_speaker_that_cannot_reopen_ends_the_call() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        h.controller
            .handle_net_event(msg(ServerMessage::Audio(chunk(240))))
            .await;
        {
            let mut state = h.speaker.state.lock().unwrap();
            state.dead = true;
            state.reject_open = true;
        }

        h.controller
            .handle_net_event(msg(ServerMessage::Audio(chunk(240))))
            .await;
        assert_eq!(h.controller.state(), CallState::Ended);
        assert_eq!(*h.controller.status(), CallStatus::DeviceFailed);
    }

    #[tokio::test]
    async fn undecodable_audio_keeps_the_call_up() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        h.controller
            .handle_net_event(msg(ServerMessage::Audio("@@@".into())))
            .await;
        assert_eq!(h.controller.state(), CallState::Active);
        h.controller.end_call();
    }

    #[tokio::test]
    async fn end_call_is_idempotent() {
        let mut h = harness(Some("t"));
        h.controller.handle_net_event(NetEvent::Open).await;
        h.controller
            .handle_net_event(msg(ServerMessage::Audio(chunk(240))))
            .await;

        h.controller.end_call();
        h.controller.end_call();
        h.controller.microphone.released().await;
        assert_eq!(h.controller.state(), CallState::Ended);
        assert_eq!(*h.controller.status(), CallStatus::Ended);
        assert_eq!(h.mic.released.load(Ordering::SeqCst), 1);
        assert_eq!(h.speaker.state.lock().unwrap().closed, 1);

        // Late transport events after hanging up change nothing.
        h.controller.handle_net_event(NetEvent::Open).await;
        assert_eq!(h.controller.state(), CallState::Ended);
        assert_eq!(h.mic.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn frames_are_ignored_unless_active() {
        let mut h = harness(Some("t"));
        h.controller.handle_capture_frame(CaptureFrame {
            pcm: bytes::Bytes::from_static(&[0, 0]),
            level: 200,
        });
        assert!(!h.view.borrow().speaking);

        h.controller.handle_net_event(NetEvent::Open).await;
        h.controller.handle_capture_frame(CaptureFrame {
            pcm: bytes::Bytes::from_static(&[0, 0]),
            level: 200,
        });
        assert!(h.view.borrow().speaking);
        h.controller.end_call();
    }

    // Full loop against a local server that drops the first three
    // connections before the handshake and serves the fourth.
    #[tokio::test]
    async fn call_survives_three_drops_and_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            for _ in 0..3 {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for text in [
                r#"{"type":"output_transcript","data":"Hello"}"#,
                r#"{"type":"output_transcript","data":" there"}"#,
                r#"{"type":"turn_complete"}"#,
            ] {
                ws.send(Message::text(text)).await.unwrap();
            }
            // Keep the session up until the client hangs up.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let mut config = Config::for_endpoint(addr.to_string(), "/ws/realtime", false);
        config.reconnect_base_delay = Duration::from_millis(10);
        let h = harness_with(Some("secret"), FakeMic::new(0.2), config);
        let mut view = h.view.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let call = tokio::spawn(h.controller.run(cmd_rx));

        let reached = tokio::time::timeout(
            Duration::from_secs(10),
            view.wait_for(|v| {
                v.state == CallState::Active
                    && v.transcript.entries().first().is_some_and(|e| e.final_)
            }),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(reached, "call never became active with a transcript");

        cmd_tx.send(CallCommand::End).await.unwrap();
        let last = call.await.unwrap();
        assert_eq!(last.state, CallState::Ended);
        assert_eq!(last.status, CallStatus::Ended);
        assert_eq!(last.transcript.entries().len(), 1);
        assert_eq!(last.transcript.entries()[0].text, "Hello there");
        assert_eq!(h.mic.released.load(Ordering::SeqCst), h.mic.opened.load(Ordering::SeqCst));

        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    }
}
