//! Matrix Transport Trait Abstractions
//!
//! The bridge core only talks to the homeserver through [`Transport`], so the
//! lifecycle can be driven by `MockTransport` in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Matrix user identifier (`@localpart:server`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Localpart without the sigil and server name.
    pub fn localpart(&self) -> Option<&str> {
        let rest = self.0.strip_prefix('@')?;
        rest.split_once(':').map(|(localpart, _)| localpart)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Matrix room identifier (`!opaque:server`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport errors that are not part of the handshake verdict
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to bind listener on {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Homeserver returned {status} {errcode}: {message}")]
    Matrix {
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("Invalid homeserver response: {0}")]
    InvalidResponse(String),

    #[error("Invalid transport configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Matrix error code carried by the response, if any.
    pub fn errcode(&self) -> Option<&str> {
        match self {
            Self::Matrix { errcode, .. } => Some(errcode),
            _ => None,
        }
    }
}

/// Outcome of a failed handshake with the homeserver.
///
/// `TokenRejected` and `ExclusivityRejected` are fatal: the bridge has no
/// valid trust relationship and must not keep serving.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("The as_token was not accepted by the homeserver")]
    TokenRejected,

    #[error("The as_token was accepted, but the bot registration was rejected as outside the exclusive namespace")]
    ExclusivityRejected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl HandshakeError {
    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TokenRejected | Self::ExclusivityRejected)
    }
}

/// Matrix application-service transport
///
/// Every method takes `&self`; implementations use interior mutability so the
/// transport can be shared between the orchestrator and startup hooks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening for homeserver transactions on `addr`.
    async fn start(&self, addr: SocketAddr) -> TransportResult<()>;

    /// Stop the listener. Stopping a transport that never started is a no-op.
    async fn stop(&self) -> TransportResult<()>;

    /// Verify credentials with the homeserver and register the bot user.
    async fn wait_for_connection(&self) -> Result<(), HandshakeError>;

    /// Prepare the bridge bot user (profile etc.).
    async fn init_as_bot(&self) -> TransportResult<()>;

    /// Accept or refuse inbound transactions.
    fn set_ready(&self, ready: bool);

    /// Send an `m.notice` into a room as the bridge bot.
    async fn send_notice(&self, room: &RoomId, text: &str) -> TransportResult<()>;

    /// The bridge bot's own user ID.
    fn bot_user_id(&self) -> &UserId;
}
