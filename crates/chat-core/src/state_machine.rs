use std::fmt;

use tracing::{debug, warn};

use crate::{
    error::ChatError,
    types::{ConnectedEvent, DisconnectCause},
};

/// Close code and reason sent when a session is shut down gracefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReason {
    pub code: u16,
    pub reason: String,
}

impl ShutdownReason {
    /// Normal client-initiated close.
    pub fn normal() -> Self {
        Self {
            code: 1000,
            reason: "Connection close by client".into(),
        }
    }
}

/// How the platform asked the connection to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Close the session with a close frame.
    WithReason {
        cause: DisconnectCause,
        shutdown: ShutdownReason,
    },
    /// Drop the session without a close handshake.
    Aborted { cause: DisconnectCause },
}

impl StopReason {
    pub fn cause(&self) -> &DisconnectCause {
        match self {
            Self::WithReason { cause, .. } | Self::Aborted { cause } => cause,
        }
    }
}

/// Connection state. Exactly one variant is active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState<S> {
    Disconnected {
        cause: DisconnectCause,
    },
    Connecting {
        session: Option<S>,
    },
    Connected {
        event: Option<ConnectedEvent>,
        session: S,
    },
    Disconnecting {
        cause: DisconnectCause,
    },
    DisconnectedPermanently {
        error: Option<ChatError>,
    },
    Destroyed,
}

impl<S> ConnectionState<S> {
    /// Variant name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected { .. } => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnecting { .. } => "disconnecting",
            Self::DisconnectedPermanently { .. } => "disconnected_permanently",
            Self::Destroyed => "destroyed",
        }
    }

    /// Session handle owned by this state, if any.
    pub fn session(&self) -> Option<&S> {
        match self {
            Self::Connecting { session } => session.as_ref(),
            Self::Connected { session, .. } => Some(session),
            _ => None,
        }
    }

    /// Connected and acknowledged by the server.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { event: Some(_), .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

/// Input of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent<S> {
    /// The caller asked for a (re)connection.
    ConnectRequested,
    /// A transport session was created for the pending connection.
    SessionCreated(S),
    /// The transport reported an open socket.
    ConnectionOpened,
    /// The server acknowledged the session.
    ConnectedEventReceived(ConnectedEvent),
    LifecycleStarted,
    LifecycleStopped(StopReason),
    LifecycleTerminate,
    /// The transport session ended.
    TransportTerminate(DisconnectCause),
    UnrecoverableError(Option<ChatError>),
}

/// Work the owner of the state machine must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect<S> {
    StartHealthMonitor,
    StopHealthMonitor,
    /// Tell the health monitor the socket is gone.
    HealthMonitorDisconnected,
    /// Open a new transport session and feed it back as `SessionCreated`.
    RequestSession,
    CloseSession {
        session: S,
        shutdown: ShutdownReason,
    },
    CancelSession(S),
    ClearConnectionConf,
    DisposeObservers,
    NotifyConnecting,
    NotifyConnected(ConnectedEvent),
    NotifyDisconnected(DisconnectCause),
}

/// Result of feeding one event into the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S> {
    /// Whether the state changed.
    pub changed: bool,
    /// Ordered side effects.
    pub effects: Vec<SideEffect<S>>,
}

impl<S> Transition<S> {
    fn unchanged() -> Self {
        Self {
            changed: false,
            effects: Vec::new(),
        }
    }

    fn changed(effects: Vec<SideEffect<S>>) -> Self {
        Self {
            changed: true,
            effects,
        }
    }
}

/// Pure connection state machine. Transitions are the only mutator.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine<S> {
    state: ConnectionState<S>,
}

impl<S> Default for ConnectionStateMachine<S> {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected {
                cause: DisconnectCause::ConnectionReleased,
            },
        }
    }
}

impl<S: Clone + fmt::Debug> ConnectionStateMachine<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ConnectionState<S> {
        &self.state
    }

    /// Apply `event` and return the side effects of the transition.
    pub fn send_event(&mut self, event: ConnectionEvent<S>) -> Transition<S> {
        use ConnectionEvent as E;
        use ConnectionState as St;
        use SideEffect as Fx;

        let current = std::mem::replace(&mut self.state, St::Destroyed);
        let (next, effects) = match (current, event) {
            (St::Destroyed, event) => {
                debug!(?event, "connection state machine is destroyed; ignoring event");
                return Transition::unchanged();
            }

            (St::DisconnectedPermanently { error }, E::UnrecoverableError(_)) => {
                self.state = St::DisconnectedPermanently { error };
                return Transition::unchanged();
            }
            (current, E::UnrecoverableError(error)) => {
                let mut effects = Vec::new();
                if let Some(session) = current.session() {
                    effects.push(Fx::CancelSession(session.clone()));
                }
                effects.extend([
                    Fx::ClearConnectionConf,
                    Fx::StopHealthMonitor,
                    Fx::NotifyDisconnected(DisconnectCause::UnrecoverableError(error.clone())),
                ]);
                (St::DisconnectedPermanently { error }, effects)
            }

            (
                St::Disconnected { .. } | St::DisconnectedPermanently { .. },
                E::ConnectRequested,
            )
            | (St::Disconnected { .. }, E::LifecycleStarted) => (
                St::Connecting { session: None },
                vec![
                    Fx::StopHealthMonitor,
                    Fx::NotifyConnecting,
                    Fx::RequestSession,
                ],
            ),
            (current @ (St::Connecting { .. } | St::Connected { .. }), E::ConnectRequested) => {
                let mut effects = Vec::new();
                if let Some(session) = current.session() {
                    effects.push(Fx::CancelSession(session.clone()));
                }
                effects.extend([Fx::NotifyConnecting, Fx::RequestSession]);
                (St::Connecting { session: None }, effects)
            }
            (St::Connecting { session: None }, E::SessionCreated(session)) => {
                (St::Connecting { session: Some(session) }, Vec::new())
            }

            (
                St::Disconnected { .. }
                | St::Disconnecting { .. }
                | St::DisconnectedPermanently { .. },
                E::LifecycleTerminate,
            ) => (St::Destroyed, vec![Fx::DisposeObservers]),
            (current @ (St::Connecting { .. } | St::Connected { .. }), E::LifecycleTerminate) => {
                let mut effects = Vec::new();
                if let Some(session) = current.session() {
                    effects.push(Fx::CancelSession(session.clone()));
                }
                effects.push(Fx::DisposeObservers);
                (St::Destroyed, effects)
            }

            (St::Connecting { session: Some(session) }, E::ConnectionOpened) => (
                St::Connected {
                    event: None,
                    session,
                },
                vec![Fx::StopHealthMonitor],
            ),
            (St::Connected { session, .. }, E::ConnectedEventReceived(event)) => (
                St::Connected {
                    event: Some(event.clone()),
                    session,
                },
                vec![Fx::StartHealthMonitor, Fx::NotifyConnected(event)],
            ),

            (St::Connecting { .. } | St::Connected { .. }, E::TransportTerminate(cause)) => {
                let mut effects = vec![Fx::NotifyDisconnected(cause.clone())];
                if cause.is_recoverable() {
                    effects.push(Fx::HealthMonitorDisconnected);
                }
                (St::Disconnected { cause }, effects)
            }
            (St::Disconnecting { cause }, E::TransportTerminate(_)) => (
                St::Disconnected {
                    cause: cause.clone(),
                },
                vec![Fx::NotifyDisconnected(cause)],
            ),

            (current @ (St::Connecting { .. } | St::Connected { .. }), E::LifecycleStopped(reason)) => {
                let mut effects = Vec::new();
                if let Some(session) = current.session() {
                    match &reason {
                        StopReason::WithReason { shutdown, .. } => effects.push(Fx::CloseSession {
                            session: session.clone(),
                            shutdown: shutdown.clone(),
                        }),
                        StopReason::Aborted { .. } => {
                            effects.push(Fx::CancelSession(session.clone()))
                        }
                    }
                }
                let cause = reason.cause().clone();
                effects.push(disconnecting_entry_effect(&cause));
                (St::Disconnecting { cause }, effects)
            }

            (current, event) => {
                warn!(
                    state = current.name(),
                    ?event,
                    "cannot handle event in current connection state"
                );
                self.state = current;
                return Transition::unchanged();
            }
        };

        debug!(state = next.name(), effects = effects.len(), "connection state changed");
        self.state = next;
        Transition::changed(effects)
    }
}

fn disconnecting_entry_effect<S>(cause: &DisconnectCause) -> SideEffect<S> {
    match cause {
        DisconnectCause::Error(_) | DisconnectCause::WebSocketNotAvailable => {
            SideEffect::HealthMonitorDisconnected
        }
        DisconnectCause::NetworkNotAvailable
        | DisconnectCause::ConnectionReleased
        | DisconnectCause::UnrecoverableError(_) => SideEffect::StopHealthMonitor,
    }
}
