//! External service connector abstractions
//!
//! One connector exists per logged-in bridge user. The bridge core only needs
//! to refresh it, stop it, and ask whether it is connected.

use crate::store::SessionState;
use async_trait::async_trait;
use std::sync::Arc;

pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("User is not logged in to the external service")]
    NotLoggedIn,

    /// The operation was cancelled before it completed. This is a control
    /// signal, not a failure.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Live session with the external service for one user
#[async_trait]
pub trait ServiceConnector: Send + Sync {
    /// Reconnect. `resync` asks for a full state reconciliation instead of a
    /// lightweight refresh.
    async fn refresh(&self, resync: bool) -> ConnectorResult<()>;

    /// Tear the session down (best effort).
    async fn stop(&self) -> ConnectorResult<()>;

    /// Whether a live session currently exists
    fn is_connected(&self) -> bool;
}

/// Builds the connector for a logged-in user
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, courpk: i64, state: &SessionState) -> Arc<dyn ServiceConnector>;
}
