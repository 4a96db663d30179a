pub mod config;
mod controller;
pub mod health;
pub mod transport;

pub use config::{ChatSocketConfig, ConfigError, HealthConfig};
pub use controller::{ChatSocket, ChatSocketDeps, SessionId, SocketControllerError, SocketState};
pub use health::{HealthCallbacks, HealthMonitor};
pub use transport::{
    ConnectionConf, LoopbackPeer, LoopbackServer, LoopbackTransport, Transport,
    TransportConnection, TransportFrame, TransportSession,
};
