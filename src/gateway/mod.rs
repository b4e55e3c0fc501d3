//! Realtime gateway connection.
//!
//! - `proto`: opcodes, frame envelope, and dispatch decoding.
//! - `transport`: the [`Connector`] seam plus websocket and in-memory links.
//! - `state`: session lifecycle states and their allowed transitions.
//! - `session`: the per-account connection worker.

/// Gateway frames and payloads.
pub mod proto;
/// Per-account connection worker.
pub mod session;
/// Session lifecycle state machine.
pub mod state;
/// Frame transports.
pub mod transport;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::rest::RestError;

pub use proto::{decode_dispatch, GatewayFrame, Hello};
pub use session::{ConnectionSession, SessionHandle, SessionSignal};
pub use state::{SessionMachine, SessionState};
pub use transport::{
    Connector, MemoryConnector, MemoryPeer, TransportEvent, TransportLink, WsConnector,
};

/// Close code sent when the token is rejected.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;
/// Close code sent when the resumed sequence is unknown.
pub const CLOSE_INVALID_SEQUENCE: u16 = 4007;
/// Close code sent when the server dropped the session.
pub const CLOSE_SESSION_TIMED_OUT: u16 = 4009;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("heartbeat not acknowledged")]
    HeartbeatTimeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("gateway closed the connection with fatal code {0}")]
    FatalClose(u16),

    #[error("no gateway endpoint: set an endpoint override or attach a rest client")]
    MissingEndpoint,

    #[error("gateway lookup failed: {0}")]
    Rest(#[from] RestError),

    #[error("gave up after {attempts} consecutive failed connections: {last}")]
    ReconnectExhausted { attempts: usize, last: String },

    #[error("session closed")]
    Closed,
}

impl GatewayError {
    /// Whether the session should reconnect after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::WebSocket(_)
            | Self::Json(_)
            | Self::Protocol(_)
            | Self::Timeout(_)
            | Self::HeartbeatTimeout
            | Self::ConnectionLost(_) => true,
            Self::Rest(err) => err.is_retryable(),
            Self::AuthenticationFailed
            | Self::FatalClose(_)
            | Self::MissingEndpoint
            | Self::ReconnectExhausted { .. }
            | Self::Closed => false,
        }
    }

    /// The account's token is no longer accepted; restarting cannot help.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            Self::AuthenticationFailed => true,
            Self::Rest(err) => err.is_fatal_for_account(),
            _ => false,
        }
    }

    /// Maps a transport close to an error.
    pub fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_AUTHENTICATION_FAILED) => Self::AuthenticationFailed,
            Some(code @ 4010..=4014) => Self::FatalClose(code),
            Some(code) => Self::ConnectionLost(format!("closed with code {code}")),
            None => Self::ConnectionLost("transport closed".to_string()),
        }
    }
}
