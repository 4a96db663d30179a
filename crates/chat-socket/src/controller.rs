use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use chat_core::{
    ChatError, ChatErrorCode, ChatEvent, ConnectionEvent, ConnectionState, ConnectionStateMachine,
    DecodedFrame, DisconnectCause, ListenerCall, ListenerDispatcher, ListenerRegistry,
    ShutdownReason, SideEffect, SocketErrorAction, SocketListener, StopReason, User,
    classify_socket_error, decode_frame, encode_event,
};
use chat_platform::{
    LifecycleHandler, LifecycleObserver, LifecycleSignal, NetworkStateListener,
    NetworkStateProvider, TokenProvider, user_id_from_token,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ChatSocketConfig,
    health::{HealthCallbacks, HealthMonitor},
    transport::{ConnectionConf, Transport, TransportConnection, TransportFrame, TransportSession},
};

/// Identifier of one transport session.
pub type SessionId = Uuid;

/// Connection state as observed from outside the controller.
pub type SocketState = ConnectionState<SessionId>;

/// Errors returned by [`ChatSocket`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketControllerError {
    /// `terminate` was called; the instance accepts no more work.
    #[error("socket controller is destroyed")]
    Destroyed,
}

/// Collaborators of the socket controller.
#[derive(Clone)]
pub struct ChatSocketDeps {
    pub transport: Arc<dyn Transport>,
    pub token_provider: Arc<dyn TokenProvider>,
    pub network: Arc<dyn NetworkStateProvider>,
    pub lifecycle: Arc<dyn LifecycleObserver>,
}

/// One transport session owned by the connection state machine.
struct SocketSession {
    id: SessionId,
    conf: ConnectionConf,
    transport: OnceLock<Arc<dyn TransportSession>>,
    cancel: CancellationToken,
    connection_event_received: AtomicBool,
}

impl SocketSession {
    fn attach(&self, transport: Arc<dyn TransportSession>) {
        if self.transport.set(transport.clone()).is_err() {
            return;
        }
        if self.cancel.is_cancelled() {
            transport.cancel();
        }
    }

    fn send(&self, text: String) -> bool {
        !self.cancel.is_cancelled() && self.transport.get().is_some_and(|t| t.send(text))
    }

    fn close(&self, shutdown: &ShutdownReason) {
        self.cancel.cancel();
        if let Some(transport) = self.transport.get() {
            transport.close(shutdown.code, &shutdown.reason);
        }
    }

    fn abort(&self) {
        self.cancel.cancel();
        if let Some(transport) = self.transport.get() {
            transport.cancel();
        }
    }
}

impl fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketSession").field("id", &self.id).finish()
    }
}

type SessionHandle = Arc<SocketSession>;

enum Command {
    Connect { conf: ConnectionConf, reconnect: bool },
    Disconnect,
    Terminate,
    Frame { session: SessionId, frame: TransportFrame },
    SessionFailed { session: SessionId, error: ChatError },
    SessionEnded { session: SessionId },
    HealthCheck,
    HealthReconnect,
    ParseRetry,
    Network(bool),
    Lifecycle(LifecycleSignal),
}

/// Forwards timer and observer callbacks into the controller task.
struct CommandBridge {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl CommandBridge {
    fn send(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            debug!("socket controller is gone; dropping callback");
        }
    }
}

impl HealthCallbacks for CommandBridge {
    fn check(&self) {
        self.send(Command::HealthCheck);
    }

    fn reconnect(&self) {
        self.send(Command::HealthReconnect);
    }
}

impl LifecycleHandler for CommandBridge {
    fn on_lifecycle(&self, signal: LifecycleSignal) {
        self.send(Command::Lifecycle(signal));
    }
}

impl NetworkStateListener for CommandBridge {
    fn on_network_connected(&self) {
        self.send(Command::Network(true));
    }

    fn on_network_disconnected(&self) {
        self.send(Command::Network(false));
    }
}

/// Combined lifecycle of app foreground state and network availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CombinedLifecycle {
    Started,
    Released,
    NetworkLost,
}

/// Handle on the realtime socket controller.
///
/// All operations are queued to a single controller task, so transitions of
/// one instance are strictly serialized.
#[derive(Clone)]
pub struct ChatSocket {
    cmd_tx: mpsc::UnboundedSender<Command>,
    listeners: Arc<ListenerRegistry>,
    state_rx: watch::Receiver<SocketState>,
    connected_session: Arc<Mutex<Option<SessionHandle>>>,
    config: Arc<ChatSocketConfig>,
}

impl ChatSocket {
    /// Spawn the controller and listener delivery tasks.
    pub fn new(config: ChatSocketConfig, deps: ChatSocketDeps) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        let (dispatcher, _delivery) =
            ListenerDispatcher::spawn(listeners.clone(), config.listener_buffer);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let machine = ConnectionStateMachine::new();
        let (state_tx, state_rx) = watch::channel(state_view(machine.state()));
        let connected_session = Arc::new(Mutex::new(None));
        let bridge = Arc::new(CommandBridge {
            cmd_tx: cmd_tx.clone(),
        });
        let config = Arc::new(config);

        let actor = SocketActor {
            monitor: HealthMonitor::new(config.health, bridge.clone()),
            lifecycle_handler: bridge.clone(),
            network_listener: bridge,
            config: config.clone(),
            deps,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            machine,
            conf: None,
            active_session: None,
            parse_attempts: 0,
            parse_retry: None,
            dispatcher,
            state_tx,
            connected_session: connected_session.clone(),
            observing: false,
            app_started: true,
            network_up: true,
            lifecycle: CombinedLifecycle::Started,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            listeners,
            state_rx,
            connected_session,
            config,
        }
    }

    /// Connect as `user`, fetching a token from the token provider.
    pub fn connect_user(&self, user: User) -> Result<(), SocketControllerError> {
        self.connect(self.user_conf(user), false)
    }

    /// Connect without a user token.
    pub fn connect_anonymously(&self) -> Result<(), SocketControllerError> {
        let conf = ConnectionConf::Anonymous {
            endpoint: self.config.wss_url.clone(),
            api_key: self.config.api_key.clone(),
        };
        self.connect(conf, false)
    }

    /// Replace the connection config with `user` and reconnect.
    pub fn reconnect_user(&self, user: User) -> Result<(), SocketControllerError> {
        self.connect(self.user_conf(user), true)
    }

    /// Stop the connection for good; a later `connect_*` starts over.
    pub fn disconnect(&self) -> Result<(), SocketControllerError> {
        self.command(Command::Disconnect)
    }

    /// Destroy the controller. Every later operation fails or no-ops.
    pub fn terminate(&self) {
        if self.command(Command::Terminate).is_err() {
            debug!("socket controller already destroyed");
        }
    }

    /// Send `event` on the socket. True only when connected and accepted by the transport.
    pub fn send_event(&self, event: &ChatEvent) -> bool {
        let session = self
            .connected_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(session) = session else {
            return false;
        };
        match encode_event(event) {
            Ok(text) => session.send(text),
            Err(err) => {
                warn!(error = %err, "cannot encode outgoing event");
                false
            }
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SocketListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SocketListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn state(&self) -> SocketState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SocketState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Server connection id while connected.
    pub fn connection_id(&self) -> Option<String> {
        match &*self.state_rx.borrow() {
            ConnectionState::Connected {
                event: Some(event), ..
            } => Some(event.connection_id.clone()),
            _ => None,
        }
    }

    fn user_conf(&self, user: User) -> ConnectionConf {
        ConnectionConf::User {
            endpoint: self.config.wss_url.clone(),
            api_key: self.config.api_key.clone(),
            user,
        }
    }

    fn connect(&self, conf: ConnectionConf, reconnect: bool) -> Result<(), SocketControllerError> {
        self.command(Command::Connect { conf, reconnect })
    }

    fn command(&self, command: Command) -> Result<(), SocketControllerError> {
        if self.state_rx.borrow().is_terminal() {
            return Err(SocketControllerError::Destroyed);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| SocketControllerError::Destroyed)
    }
}

struct SocketActor {
    config: Arc<ChatSocketConfig>,
    deps: ChatSocketDeps,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    machine: ConnectionStateMachine<SessionHandle>,
    conf: Option<ConnectionConf>,
    active_session: Option<SessionId>,
    parse_attempts: u32,
    parse_retry: Option<CancellationToken>,
    monitor: HealthMonitor,
    dispatcher: ListenerDispatcher,
    state_tx: watch::Sender<SocketState>,
    connected_session: Arc<Mutex<Option<SessionHandle>>>,
    lifecycle_handler: Arc<dyn LifecycleHandler>,
    network_listener: Arc<dyn NetworkStateListener>,
    observing: bool,
    app_started: bool,
    network_up: bool,
    lifecycle: CombinedLifecycle,
}

impl SocketActor {
    async fn run(mut self) {
        while let Some(command) = self.cmd_rx.recv().await {
            self.handle_command(command).await;
            if self.machine.state().is_terminal() {
                break;
            }
        }
        self.monitor.stop();
        self.cancel_parse_retry();
        self.stop_observers();
        info!("socket controller finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { conf, reconnect } => self.handle_connect(conf, reconnect).await,
            Command::Disconnect => self.handle_disconnect().await,
            Command::Terminate => self.apply(ConnectionEvent::LifecycleTerminate).await,
            Command::Frame { session, frame } => {
                if self.is_active(session) {
                    self.handle_frame(frame).await;
                } else {
                    debug!(%session, "dropping frame from stale session");
                }
            }
            Command::SessionFailed { session, error } => {
                if self.is_active(session) {
                    self.handle_session_failed(error).await;
                }
            }
            Command::SessionEnded { session } => {
                if self.is_active(session) {
                    let closed = ChatError::network(ChatErrorCode::SocketClosed, "socket closed");
                    self.apply(ConnectionEvent::TransportTerminate(DisconnectCause::Error(Some(
                        closed,
                    ))))
                    .await;
                }
            }
            Command::HealthCheck => self.handle_health_check(),
            Command::HealthReconnect => self.handle_health_reconnect().await,
            Command::ParseRetry => {
                self.parse_retry = None;
                if self.conf.is_some() && self.is_live() {
                    info!(attempt = self.parse_attempts, "reconnecting after parse failure");
                    self.apply(ConnectionEvent::ConnectRequested).await;
                }
            }
            Command::Network(up) => {
                self.network_up = up;
                self.update_lifecycle().await;
            }
            Command::Lifecycle(LifecycleSignal::Terminate) => {
                self.apply(ConnectionEvent::LifecycleTerminate).await
            }
            Command::Lifecycle(signal) => {
                self.app_started = signal == LifecycleSignal::Started;
                self.update_lifecycle().await;
            }
        }
    }

    async fn handle_connect(&mut self, conf: ConnectionConf, reconnect: bool) {
        info!(
            reconnect,
            anonymous = conf.is_anonymous(),
            user_id = conf.user().map(|user| user.id.as_str()).unwrap_or_default(),
            "connect requested"
        );
        self.start_observers();
        self.conf = Some(conf);
        if !self.deps.network.is_connected() {
            warn!("network is not available; not connecting");
            self.apply(ConnectionEvent::UnrecoverableError(Some(
                ChatError::network_not_available(),
            )))
            .await;
            return;
        }
        self.apply(ConnectionEvent::ConnectRequested).await;
    }

    async fn handle_disconnect(&mut self) {
        info!("disconnect requested");
        self.parse_attempts = 0;
        self.cancel_parse_retry();
        self.apply(ConnectionEvent::UnrecoverableError(None)).await;
    }

    async fn handle_frame(&mut self, frame: TransportFrame) {
        match frame {
            TransportFrame::Opened => self.apply(ConnectionEvent::ConnectionOpened).await,
            TransportFrame::Message(text) => match decode_frame(&text) {
                Ok(DecodedFrame::Event(event)) => self.handle_event(event).await,
                Ok(DecodedFrame::Error(err)) | Err(err) => self.handle_error(err).await,
            },
            TransportFrame::Failure(err) => self.handle_error(err).await,
        }
    }

    async fn handle_event(&mut self, event: ChatEvent) {
        let Some(session) = self.machine.state().session().cloned() else {
            debug!(event = event.type_name(), "event without a session");
            return;
        };

        if !session.connection_event_received.load(Ordering::SeqCst) {
            match event {
                ChatEvent::Connected(connected) => {
                    session
                        .connection_event_received
                        .store(true, Ordering::SeqCst);
                    self.parse_attempts = 0;
                    self.monitor.ack();
                    info!(connection_id = %connected.connection_id, "connection acknowledged");
                    self.apply(ConnectionEvent::ConnectedEventReceived(connected))
                        .await;
                }
                other => {
                    let err = ChatError::network(
                        ChatErrorCode::CantParseConnectionEvent,
                        format!(
                            "expected connection.ok as first event, got {}",
                            other.type_name()
                        ),
                    );
                    self.handle_error(err).await;
                }
            }
            return;
        }

        self.monitor.ack();
        match event {
            ChatEvent::HealthCheck { .. } => {}
            ChatEvent::Connected(_) => debug!("ignoring repeated connection acknowledgement"),
            event => self.notify(ListenerCall::Event(event)).await,
        }
    }

    async fn handle_error(&mut self, err: ChatError) {
        if !self.is_live() {
            return;
        }
        error!(code = err.code.code(), error = %err, "socket error");
        self.notify(ListenerCall::Error(err.clone())).await;

        match classify_socket_error(&err) {
            SocketErrorAction::ReportOnly => {}
            SocketErrorAction::Unrecoverable => self.fail_permanently(err).await,
            SocketErrorAction::RetryParse => self.schedule_parse_retry(err).await,
            SocketErrorAction::Disconnect => self.disconnect_with_error(err).await,
        }
    }

    async fn handle_session_failed(&mut self, err: ChatError) {
        error!(code = err.code.code(), error = %err, "cannot open socket session");
        self.notify(ListenerCall::Error(err.clone())).await;
        match classify_socket_error(&err) {
            SocketErrorAction::Unrecoverable => self.fail_permanently(err).await,
            _ => {
                self.apply(ConnectionEvent::TransportTerminate(DisconnectCause::Error(
                    Some(err),
                )))
                .await
            }
        }
    }

    async fn fail_permanently(&mut self, err: ChatError) {
        if err.code.is_token_error() {
            self.deps.token_provider.expire_token();
        }
        self.apply(ConnectionEvent::UnrecoverableError(Some(err)))
            .await;
    }

    async fn disconnect_with_error(&mut self, err: ChatError) {
        self.apply(ConnectionEvent::LifecycleStopped(StopReason::WithReason {
            cause: DisconnectCause::Error(Some(err)),
            shutdown: ShutdownReason::normal(),
        }))
        .await;
    }

    async fn schedule_parse_retry(&mut self, err: ChatError) {
        let Some(delay) = self.config.parse_retry.delay_for_attempt(self.parse_attempts) else {
            warn!(attempts = self.parse_attempts, "parse retry limit reached");
            self.disconnect_with_error(err).await;
            return;
        };
        self.parse_attempts += 1;
        self.cancel_parse_retry();

        let token = CancellationToken::new();
        self.parse_retry = Some(token.clone());
        let cmd_tx = self.cmd_tx.clone();
        debug!(delay_ms = delay.as_millis() as u64, "parse retry scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = cmd_tx.send(Command::ParseRetry);
                }
            }
        });
    }

    fn cancel_parse_retry(&mut self) {
        if let Some(token) = self.parse_retry.take() {
            token.cancel();
        }
    }

    fn handle_health_check(&self) {
        let ConnectionState::Connected {
            event: Some(connected),
            session,
        } = self.machine.state()
        else {
            return;
        };
        let check = ChatEvent::HealthCheck {
            connection_id: connected.connection_id.clone(),
            created_at: now_ms(),
        };
        match encode_event(&check) {
            Ok(text) => {
                if !session.send(text) {
                    debug!("health check not accepted by transport");
                }
            }
            Err(err) => warn!(error = %err, "cannot encode health check"),
        }
    }

    async fn handle_health_reconnect(&mut self) {
        if self.conf.is_none() {
            return;
        }
        let (recoverable, stale) = match self.machine.state() {
            ConnectionState::Disconnected { cause } => (cause.is_recoverable(), false),
            ConnectionState::Connected { .. } => (false, true),
            _ => (false, false),
        };
        if recoverable {
            info!("health monitor reconnecting");
            self.apply(ConnectionEvent::ConnectRequested).await;
        } else if stale {
            warn!("no socket events within threshold; dropping connection");
            self.apply(ConnectionEvent::LifecycleStopped(StopReason::Aborted {
                cause: DisconnectCause::WebSocketNotAvailable,
            }))
            .await;
        }
    }

    async fn update_lifecycle(&mut self) {
        let next = if !self.network_up {
            CombinedLifecycle::NetworkLost
        } else if !self.app_started {
            CombinedLifecycle::Released
        } else {
            CombinedLifecycle::Started
        };
        if next == self.lifecycle {
            return;
        }
        self.lifecycle = next;
        debug!(lifecycle = ?next, "lifecycle changed");

        let live_session = matches!(
            self.machine.state(),
            ConnectionState::Connecting { .. } | ConnectionState::Connected { .. }
        );
        match next {
            CombinedLifecycle::Started => {
                if matches!(self.machine.state(), ConnectionState::Disconnected { .. }) {
                    self.apply(ConnectionEvent::LifecycleStarted).await;
                }
            }
            CombinedLifecycle::Released if live_session => {
                self.apply(ConnectionEvent::LifecycleStopped(StopReason::WithReason {
                    cause: DisconnectCause::ConnectionReleased,
                    shutdown: ShutdownReason::normal(),
                }))
                .await;
            }
            CombinedLifecycle::NetworkLost if live_session => {
                self.apply(ConnectionEvent::LifecycleStopped(StopReason::Aborted {
                    cause: DisconnectCause::NetworkNotAvailable,
                }))
                .await;
            }
            CombinedLifecycle::Released | CombinedLifecycle::NetworkLost => {}
        }
    }

    /// Feed `event` to the state machine and run every resulting side effect.
    async fn apply(&mut self, event: ConnectionEvent<SessionHandle>) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let transition = self.machine.send_event(event);
            for effect in transition.effects {
                if let Some(next) = self.run_effect(effect).await {
                    queue.push_back(next);
                }
            }
            if transition.changed {
                self.publish_state();
            }
        }
    }

    async fn run_effect(
        &mut self,
        effect: SideEffect<SessionHandle>,
    ) -> Option<ConnectionEvent<SessionHandle>> {
        match effect {
            SideEffect::StartHealthMonitor => self.monitor.start(),
            SideEffect::StopHealthMonitor => self.monitor.stop(),
            SideEffect::HealthMonitorDisconnected => self.monitor.on_disconnected(),
            SideEffect::RequestSession => return Some(self.request_session()),
            SideEffect::CloseSession { session, shutdown } => {
                debug!(session = %session.id, code = shutdown.code, "closing session");
                session.close(&shutdown);
            }
            SideEffect::CancelSession(session) => {
                debug!(session = %session.id, "cancelling session");
                session.abort();
            }
            SideEffect::ClearConnectionConf => self.conf = None,
            SideEffect::DisposeObservers => self.stop_observers(),
            SideEffect::NotifyConnecting => self.notify(ListenerCall::Connecting).await,
            SideEffect::NotifyConnected(event) => {
                self.notify(ListenerCall::Connected(event)).await
            }
            SideEffect::NotifyDisconnected(cause) => {
                info!(?cause, "socket disconnected");
                self.notify(ListenerCall::Disconnected(cause)).await
            }
        }
        None
    }

    fn request_session(&mut self) -> ConnectionEvent<SessionHandle> {
        let Some(conf) = self.conf.clone() else {
            debug!("no connection config; nothing to connect");
            self.active_session = None;
            return ConnectionEvent::TransportTerminate(DisconnectCause::ConnectionReleased);
        };

        let session = Arc::new(SocketSession {
            id: Uuid::new_v4(),
            conf,
            transport: OnceLock::new(),
            cancel: CancellationToken::new(),
            connection_event_received: AtomicBool::new(false),
        });
        debug!(session = %session.id, "opening socket session");
        self.active_session = Some(session.id);
        tokio::spawn(run_session(
            session.clone(),
            self.deps.transport.clone(),
            self.deps.token_provider.clone(),
            self.cmd_tx.clone(),
        ));
        ConnectionEvent::SessionCreated(session)
    }

    fn publish_state(&mut self) {
        let connected = match self.machine.state() {
            ConnectionState::Connected {
                event: Some(_),
                session,
            } => Some(session.clone()),
            _ => None,
        };
        *self
            .connected_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = connected;

        let permanent = matches!(
            self.machine.state(),
            ConnectionState::DisconnectedPermanently { .. }
        );
        if permanent {
            self.stop_observers();
        }
        if permanent || self.machine.state().is_terminal() {
            self.active_session = None;
        }

        self.state_tx.send_replace(state_view(self.machine.state()));
    }

    async fn notify(&self, call: ListenerCall) {
        if self.dispatcher.dispatch(call).await.is_err() {
            warn!("listener delivery task is gone");
        }
    }

    fn start_observers(&mut self) {
        if self.observing {
            return;
        }
        self.observing = true;
        self.network_up = self.deps.network.is_connected();
        self.app_started = true;
        self.lifecycle = if self.network_up {
            CombinedLifecycle::Started
        } else {
            CombinedLifecycle::NetworkLost
        };
        self.deps.lifecycle.observe(self.lifecycle_handler.clone());
        self.deps.network.subscribe(self.network_listener.clone());
    }

    fn stop_observers(&mut self) {
        if !self.observing {
            return;
        }
        self.observing = false;
        self.deps.lifecycle.dispose(&self.lifecycle_handler);
        self.deps.network.unsubscribe(&self.network_listener);
    }

    fn is_active(&self, session: SessionId) -> bool {
        self.active_session == Some(session)
    }

    fn is_live(&self) -> bool {
        !matches!(
            self.machine.state(),
            ConnectionState::DisconnectedPermanently { .. } | ConnectionState::Destroyed
        )
    }
}

async fn run_session(
    session: SessionHandle,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    let id = session.id;
    let cancel = session.cancel.clone();
    let opened = tokio::select! {
        _ = cancel.cancelled() => None,
        result = open_session(&session, transport.as_ref(), tokens.as_ref()) => Some(result),
    };

    let mut frames = match opened {
        None => {
            let _ = cmd_tx.send(Command::SessionEnded { session: id });
            return;
        }
        Some(Err(error)) => {
            let _ = cmd_tx.send(Command::SessionFailed { session: id, error });
            return;
        }
        Some(Ok(TransportConnection {
            session: transport_session,
            frames,
        })) => {
            session.attach(transport_session);
            frames
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if cmd_tx.send(Command::Frame { session: id, frame }).is_err() {
                        return;
                    }
                }
                None => break,
            },
        }
    }
    debug!(session = %id, "socket session ended");
    let _ = cmd_tx.send(Command::SessionEnded { session: id });
}

async fn open_session(
    session: &SocketSession,
    transport: &dyn Transport,
    tokens: &dyn TokenProvider,
) -> Result<TransportConnection, ChatError> {
    let token = match session.conf.user() {
        None => None,
        Some(user) => {
            let token = tokens.ensure_token_loaded().await?;
            if let Ok(token_user) = user_id_from_token(&token) {
                if token_user != user.id {
                    return Err(ChatError::network(
                        ChatErrorCode::InvalidToken,
                        format!("token belongs to '{token_user}', not '{}'", user.id),
                    ));
                }
            }
            Some(token)
        }
    };
    transport.open(&session.conf, token).await
}

fn state_view(state: &ConnectionState<SessionHandle>) -> SocketState {
    match state {
        ConnectionState::Disconnected { cause } => ConnectionState::Disconnected {
            cause: cause.clone(),
        },
        ConnectionState::Connecting { session } => ConnectionState::Connecting {
            session: session.as_ref().map(|session| session.id),
        },
        ConnectionState::Connected { event, session } => ConnectionState::Connected {
            event: event.clone(),
            session: session.id,
        },
        ConnectionState::Disconnecting { cause } => ConnectionState::Disconnecting {
            cause: cause.clone(),
        },
        ConnectionState::DisconnectedPermanently { error } => {
            ConnectionState::DisconnectedPermanently {
                error: error.clone(),
            }
        }
        ConnectionState::Destroyed => ConnectionState::Destroyed,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
