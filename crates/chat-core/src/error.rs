use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for recovery decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Transient socket or network failure.
    Transport,
    /// Frame or payload could not be decoded.
    Protocol,
    /// Token or API key rejected.
    Authentication,
    /// Request rejected by server-side validation.
    Validation,
    /// Failure that no retry can fix.
    Unrecoverable,
}

/// Whether an error came from the network path or from local logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// Socket, HTTP or server reported error.
    Network,
    /// Any other failure.
    Generic,
}

/// Stable numeric error codes shared with the server protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCode {
    ApiKeyNotFound,
    ValidationError,
    TokenExpired,
    TokenNotValid,
    TokenDateIncorrect,
    TokenSignatureIncorrect,
    NetworkFailed,
    ParserError,
    SocketClosed,
    SocketFailure,
    CantParseConnectionEvent,
    CantParseEvent,
    InvalidToken,
    UndefinedToken,
    UnableToParseSocketEvent,
    NoErrorBody,
    NetworkNotAvailable,
    /// Server code this client does not know.
    Other(i32),
}

impl ChatErrorCode {
    /// Numeric code as sent on the wire.
    pub fn code(self) -> i32 {
        match self {
            Self::ApiKeyNotFound => 2,
            Self::ValidationError => 4,
            Self::TokenExpired => 40,
            Self::TokenNotValid => 41,
            Self::TokenDateIncorrect => 42,
            Self::TokenSignatureIncorrect => 43,
            Self::NetworkFailed => 1000,
            Self::ParserError => 1001,
            Self::SocketClosed => 1002,
            Self::SocketFailure => 1003,
            Self::CantParseConnectionEvent => 1004,
            Self::CantParseEvent => 1005,
            Self::InvalidToken => 1006,
            Self::UndefinedToken => 1007,
            Self::UnableToParseSocketEvent => 1008,
            Self::NoErrorBody => 1009,
            Self::NetworkNotAvailable => 1010,
            Self::Other(code) => code,
        }
    }

    /// Resolve a wire code.
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::ApiKeyNotFound,
            4 => Self::ValidationError,
            40 => Self::TokenExpired,
            41 => Self::TokenNotValid,
            42 => Self::TokenDateIncorrect,
            43 => Self::TokenSignatureIncorrect,
            1000 => Self::NetworkFailed,
            1001 => Self::ParserError,
            1002 => Self::SocketClosed,
            1003 => Self::SocketFailure,
            1004 => Self::CantParseConnectionEvent,
            1005 => Self::CantParseEvent,
            1006 => Self::InvalidToken,
            1007 => Self::UndefinedToken,
            1008 => Self::UnableToParseSocketEvent,
            1009 => Self::NoErrorBody,
            1010 => Self::NetworkNotAvailable,
            other => Self::Other(other),
        }
    }

    /// Category of this code.
    pub fn category(self) -> ChatErrorCategory {
        match self {
            Self::TokenExpired
            | Self::TokenNotValid
            | Self::TokenDateIncorrect
            | Self::TokenSignatureIncorrect
            | Self::InvalidToken
            | Self::UndefinedToken
            | Self::ApiKeyNotFound => ChatErrorCategory::Authentication,
            Self::ValidationError => ChatErrorCategory::Validation,
            Self::ParserError
            | Self::CantParseConnectionEvent
            | Self::CantParseEvent
            | Self::UnableToParseSocketEvent
            | Self::NoErrorBody => ChatErrorCategory::Protocol,
            Self::NetworkNotAvailable => ChatErrorCategory::Unrecoverable,
            Self::NetworkFailed | Self::SocketClosed | Self::SocketFailure | Self::Other(_) => {
                ChatErrorCategory::Transport
            }
        }
    }

    /// Token rejected by the server; the cached token must be dropped.
    pub fn is_token_error(self) -> bool {
        matches!(
            self,
            Self::TokenExpired
                | Self::TokenNotValid
                | Self::TokenDateIncorrect
                | Self::TokenSignatureIncorrect
                | Self::InvalidToken
                | Self::UndefinedToken
        )
    }
}

/// Error payload surfaced to listeners and returned by fallible operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{}: {message}", code.code())]
pub struct ChatError {
    /// Network or generic origin.
    pub kind: ChatErrorKind,
    /// Stable error code.
    pub code: ChatErrorCode,
    /// Human-readable message.
    pub message: String,
    /// HTTP-like status code reported by the server, if any.
    pub status_code: Option<u16>,
}

impl ChatError {
    /// Construct a network error.
    pub fn network(code: ChatErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind: ChatErrorKind::Network,
            code,
            message: message.into(),
            status_code: None,
        }
    }

    /// Construct a non-network error.
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: ChatErrorKind::Generic,
            code: ChatErrorCode::Other(-1),
            message: message.into(),
            status_code: None,
        }
    }

    /// Attach a status code.
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Error returned when a connection is attempted without network.
    pub fn network_not_available() -> Self {
        Self::network(ChatErrorCode::NetworkNotAvailable, "network is not available")
    }

    /// Whether this error originated on the network path.
    pub fn is_network(&self) -> bool {
        self.kind == ChatErrorKind::Network
    }

    /// Category of the error code.
    pub fn category(&self) -> ChatErrorCategory {
        self.code.category()
    }

    /// Failures that repeating the same request cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.category(),
            ChatErrorCategory::Authentication | ChatErrorCategory::Validation
        ) || self
            .status_code
            .is_some_and(|status| (400..500).contains(&status) && status != 429)
    }
}

/// What the socket controller does with an error reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketErrorAction {
    /// Stop permanently and expire the cached token when token related.
    Unrecoverable,
    /// Reconnect after a capped parse retry delay.
    RetryParse,
    /// Drop to a recoverable disconnect and let health monitoring reconnect.
    Disconnect,
    /// Forward to listeners without touching the connection.
    ReportOnly,
}

/// Decide how the socket controller reacts to `error`.
pub fn classify_socket_error(error: &ChatError) -> SocketErrorAction {
    if !error.is_network() {
        return SocketErrorAction::ReportOnly;
    }
    match error.category() {
        ChatErrorCategory::Authentication | ChatErrorCategory::Validation => {
            SocketErrorAction::Unrecoverable
        }
        ChatErrorCategory::Protocol => SocketErrorAction::RetryParse,
        ChatErrorCategory::Transport | ChatErrorCategory::Unrecoverable => {
            SocketErrorAction::Disconnect
        }
    }
}
