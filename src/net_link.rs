use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use crate::protocol::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, CLOSE_NORMAL, ServerMessage, session_url,
};

// 主动关闭后等待服务端回应 close 帧的时间
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug)]
pub enum NetEvent {
    Open,
    Message(ServerMessage),
    /// Socket-level failure. The connection is gone; what happens next is
    /// reported by the following `Reconnecting` or `Closed`.
    Error(String),
    /// Abnormal close, another attempt follows after `delay`.
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
        code: u16,
    },
    /// Terminal. No more events after this one.
    Closed {
        code: u16,
        reason: String,
        manual: bool,
    },
}

/// Linear backoff with a ceiling: `base * attempt` for attempts 1..=max.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt, or `None` if this close is final.
    pub fn next_delay(&mut self, close_code: u16, manual: bool) -> Option<Duration> {
        if manual || close_code == CLOSE_NORMAL || self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.base_delay * self.attempts)
    }
}

struct Shared {
    state: AtomicU8,
    manual: AtomicBool,
    close: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Caller side of a running [`NetLink`].
#[derive(Clone)]
pub struct NetHandle {
    audio_tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
}

impl NetHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Queue one PCM16 frame. Dropped unless the socket is open or when the
    /// send queue is full; returns whether it was queued.
    pub fn send_audio(&self, pcm: Bytes) -> bool {
        if self.shared.state() != ConnectionState::Open {
            return false;
        }
        self.audio_tx.try_send(pcm).is_ok()
    }

    /// Close for good: no reconnect follows. Idempotent.
    pub fn close(&self) {
        self.shared.manual.store(true, Ordering::SeqCst);
        self.shared.close.notify_one();
    }
}

struct CloseInfo {
    code: u16,
    reason: String,
}

pub struct NetLink {
    endpoint: Url,
    token: Option<String>,
    policy: ReconnectPolicy,
    tx: mpsc::Sender<NetEvent>,
    rx_audio: mpsc::Receiver<Bytes>,
    shared: Arc<Shared>,
}

impl NetLink {
    pub fn new(
        endpoint: Url,
        token: Option<String>,
        policy: ReconnectPolicy,
        tx: mpsc::Sender<NetEvent>,
    ) -> (Self, NetHandle) {
        let (audio_tx, rx_audio) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Idle as u8),
            manual: AtomicBool::new(false),
            close: Notify::new(),
        });
        let handle = NetHandle {
            audio_tx,
            shared: shared.clone(),
        };
        let link = Self {
            endpoint,
            token,
            policy,
            tx,
            rx_audio,
            shared,
        };
        (link, handle)
    }

    /// Connect and keep the session alive until it is closed manually, by
    /// the server with 1000, or the reconnect budget runs out.
    pub async fn run(mut self) {
        loop {
            self.shared.set_state(ConnectionState::Connecting);
            let close = match self.connect_and_loop().await {
                Ok(close) => close,
                Err(e) => {
                    log::error!("Connection error: {}", e);
                    let _ = self.tx.send(NetEvent::Error(e.to_string())).await;
                    CloseInfo {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                    }
                }
            };

            let manual = self.shared.manual.load(Ordering::SeqCst);
            log::info!(
                "Connection closed: code={}, reason={:?}, manual={}",
                close.code,
                close.reason,
                manual
            );

            let Some(delay) = self.policy.next_delay(close.code, manual) else {
                self.finish(close, manual).await;
                return;
            };

            log::info!(
                "Reconnecting {}/{} in {:?}...",
                self.policy.attempts(),
                self.policy.max_attempts(),
                delay
            );
            self.shared.set_state(ConnectionState::Connecting);
            let _ = self
                .tx
                .send(NetEvent::Reconnecting {
                    attempt: self.policy.attempts(),
                    max_attempts: self.policy.max_attempts(),
                    delay,
                    code: close.code,
                })
                .await;

            if !self.wait_before_retry(delay).await {
                self.finish(
                    CloseInfo {
                        code: close.code,
                        reason: "closed while waiting to reconnect".into(),
                    },
                    true,
                )
                .await;
                return;
            }
        }
    }

    async fn finish(&mut self, close: CloseInfo, manual: bool) {
        self.shared.set_state(ConnectionState::Closed);
        let _ = self
            .tx
            .send(NetEvent::Closed {
                code: close.code,
                reason: close.reason,
                manual,
            })
            .await;
    }

    // Returns false if the session was closed during the wait.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.shared.close.notified() => return false,
                _ = &mut sleep => return true,
                frame = self.rx_audio.recv() => {
                    if frame.is_none() {
                        self.shared.manual.store(true, Ordering::SeqCst);
                        return false;
                    }
                    // Not connected: stale audio is dropped.
                }
            }
        }
    }

    async fn connect_and_loop(&mut self) -> anyhow::Result<CloseInfo> {
        let url = session_url(&self.endpoint, self.token.as_deref());
        log::info!("Connecting to {}...", self.endpoint);

        let ws_stream = tokio::select! {
            biased;
            _ = self.shared.close.notified() => {
                self.shared.manual.store(true, Ordering::SeqCst);
                return Ok(CloseInfo {
                    code: CLOSE_NO_STATUS,
                    reason: "closed while connecting".into(),
                });
            }
            res = connect_async(url.as_str()) => res?.0,
        };
        log::info!("Connected!");

        let (mut write, mut read) = ws_stream.split();

        // Frames captured before this connection existed are stale.
        while self.rx_audio.try_recv().is_ok() {}

        self.policy.reset();
        self.shared.set_state(ConnectionState::Open);
        let _ = self.tx.send(NetEvent::Open).await;

        // 主循环，处理读取和写入
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match ServerMessage::parse(text.as_str()) {
                                Ok(ServerMessage::Unknown(tag)) => {
                                    log::warn!("Unknown message type: {}", tag);
                                }
                                Ok(msg) => {
                                    let _ = self.tx.send(NetEvent::Message(msg)).await;
                                }
                                Err(e) => {
                                    log::error!("Failed to parse server message: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("Ignoring {} bytes of binary from server", data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed connection: {:?}", frame);
                            self.shared.set_state(ConnectionState::Closing);
                            let _ = write.close().await;
                            return Ok(match frame {
                                Some(frame) => CloseInfo {
                                    code: u16::from(frame.code),
                                    reason: frame.reason.as_str().to_string(),
                                },
                                None => CloseInfo {
                                    code: CLOSE_NO_STATUS,
                                    reason: String::new(),
                                },
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Ok(CloseInfo {
                                code: CLOSE_ABNORMAL,
                                reason: "connection dropped".into(),
                            });
                        }
                    }
                }
                frame = self.rx_audio.recv() => {
                    match frame {
                        Some(pcm) => write.send(Message::Binary(pcm)).await?,
                        None => {
                            // Every handle is gone; nobody can use this session anymore.
                            self.shared.manual.store(true, Ordering::SeqCst);
                            return Ok(self.close_gracefully(&mut write, &mut read).await);
                        }
                    }
                }
                _ = self.shared.close.notified() => {
                    self.shared.manual.store(true, Ordering::SeqCst);
                    return Ok(self.close_gracefully(&mut write, &mut read).await);
                }
            }
        }
    }

    async fn close_gracefully<W, R>(&self, write: &mut W, read: &mut R) -> CloseInfo
    where
        W: futures_util::Sink<Message> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        self.shared.set_state(ConnectionState::Closing);
        let _ = write.send(Message::Close(None)).await;

        let reply = tokio::time::timeout(CLOSE_TIMEOUT, async {
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Close(frame) = msg {
                    return frame;
                }
            }
            None
        })
        .await;

        match reply {
            Ok(Some(frame)) => CloseInfo {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_string(),
            },
            _ => CloseInfo {
                code: CLOSE_NO_STATUS,
                reason: "closed by client".into(),
            },
        }
    }
}
