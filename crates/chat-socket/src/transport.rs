use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chat_core::{ChatError, ChatErrorCode, ChatEvent, User, encode_event};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const FRAME_BUFFER: usize = 64;

/// Parameters of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionConf {
    Anonymous {
        endpoint: Url,
        api_key: String,
    },
    User {
        endpoint: Url,
        api_key: String,
        user: User,
    },
}

impl ConnectionConf {
    pub fn endpoint(&self) -> &Url {
        match self {
            Self::Anonymous { endpoint, .. } | Self::User { endpoint, .. } => endpoint,
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            Self::Anonymous { api_key, .. } | Self::User { api_key, .. } => api_key,
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Self::Anonymous { .. } => None,
            Self::User { user, .. } => Some(user),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous { .. })
    }
}

/// Frame delivered by an open transport session. End of stream means the
/// session terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Opened,
    Message(String),
    Failure(ChatError),
}

/// Handle on one live transport session.
pub trait TransportSession: Send + Sync {
    /// Queue a text frame. Returns false when the session no longer accepts data.
    fn send(&self, text: String) -> bool;
    /// Graceful close with a close frame.
    fn close(&self, code: u16, reason: &str);
    /// Drop the session immediately.
    fn cancel(&self);
}

/// Session plus its inbound frame stream.
pub struct TransportConnection {
    pub session: Arc<dyn TransportSession>,
    pub frames: mpsc::Receiver<TransportFrame>,
}

/// Opens socket sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(
        &self,
        conf: &ConnectionConf,
        token: Option<String>,
    ) -> Result<TransportConnection, ChatError>;
}

/// Server side of one loopback session.
pub struct LoopbackPeer {
    conf: ConnectionConf,
    token: Option<String>,
    frames_tx: mpsc::Sender<TransportFrame>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
    close_code: Arc<Mutex<Option<u16>>>,
}

impl LoopbackPeer {
    pub fn conf(&self) -> &ConnectionConf {
        &self.conf
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Signal that the socket is open.
    pub async fn open(&self) -> bool {
        self.push(TransportFrame::Opened).await
    }

    pub async fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(TransportFrame::Message(text.into())).await
    }

    pub async fn push_event(&self, event: &ChatEvent) -> bool {
        match encode_event(event) {
            Ok(text) => self.push_text(text).await,
            Err(_) => false,
        }
    }

    pub async fn fail(&self, error: ChatError) -> bool {
        self.push(TransportFrame::Failure(error)).await
    }

    async fn push(&self, frame: TransportFrame) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.frames_tx.send(frame).await.is_ok()
    }

    /// Next text frame sent by the client.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.outbound_rx.recv().await
    }

    /// Resolves once the client closed or cancelled the session.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close code sent by the client, `None` when cancelled or still open.
    pub fn close_code(&self) -> Option<u16> {
        *self.close_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the server side, ending the client's frame stream.
    pub fn hang_up(self) {
        self.closed.cancel();
    }
}

struct LoopbackSession {
    outbound_tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
    close_code: Arc<Mutex<Option<u16>>>,
}

impl TransportSession for LoopbackSession {
    fn send(&self, text: String) -> bool {
        !self.closed.is_cancelled() && self.outbound_tx.send(text).is_ok()
    }

    fn close(&self, code: u16, reason: &str) {
        debug!(code, reason, "closing loopback session");
        *self.close_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
        self.closed.cancel();
    }

    fn cancel(&self) {
        debug!("cancelling loopback session");
        self.closed.cancel();
    }
}

/// In-process transport. Every `open` hands a [`LoopbackPeer`] to the paired
/// [`LoopbackServer`].
#[derive(Clone)]
pub struct LoopbackTransport {
    peers_tx: mpsc::UnboundedSender<LoopbackPeer>,
    opened: Arc<AtomicUsize>,
    refuse_with: Arc<Mutex<Option<ChatError>>>,
}

/// Receiving end of [`LoopbackTransport`].
pub struct LoopbackServer {
    peers_rx: mpsc::UnboundedReceiver<LoopbackPeer>,
}

impl LoopbackServer {
    /// Wait for the next session opened by the client.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.peers_rx.recv().await
    }
}

impl LoopbackTransport {
    pub fn new() -> (Self, LoopbackServer) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers_tx,
                opened: Arc::new(AtomicUsize::new(0)),
                refuse_with: Arc::new(Mutex::new(None)),
            },
            LoopbackServer { peers_rx },
        )
    }

    /// Number of sessions opened so far.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Make every following `open` fail with `error`, or succeed again with `None`.
    pub fn refuse_with(&self, error: Option<ChatError>) {
        *self.refuse_with.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(
        &self,
        conf: &ConnectionConf,
        token: Option<String>,
    ) -> Result<TransportConnection, ChatError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .refuse_with
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(error);
        }

        let (server_tx, mut server_rx) = mpsc::channel(FRAME_BUFFER);
        let (frames_tx, frames) = mpsc::channel(FRAME_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let close_code = Arc::new(Mutex::new(None));

        let forward_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = forward_closed.cancelled() => break,
                    frame = server_rx.recv() => match frame {
                        Some(frame) => {
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let peer = LoopbackPeer {
            conf: conf.clone(),
            token,
            frames_tx: server_tx,
            outbound_rx,
            closed: closed.clone(),
            close_code: close_code.clone(),
        };
        self.peers_tx.send(peer).map_err(|_| {
            ChatError::network(ChatErrorCode::SocketFailure, "loopback server is gone")
        })?;

        Ok(TransportConnection {
            session: Arc::new(LoopbackSession {
                outbound_tx,
                closed,
                close_code,
            }),
            frames,
        })
    }
}
