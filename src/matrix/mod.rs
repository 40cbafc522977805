//! Matrix Application Service Integration
//!
//! The bridge reaches the homeserver through the [`Transport`] trait:
//! - `AppserviceTransport` for production (axum listener + reqwest client)
//! - `MockTransport` for tests
//!
//! Ghost users are described by [`GhostNamespace`].

pub mod appservice;
pub mod ghost;
pub mod mock;
pub mod retry;
pub mod traits;

pub use appservice::{AppserviceConfig, AppserviceTransport};
pub use ghost::{GhostNamespace, TemplateError, USERID_PLACEHOLDER};
pub use mock::{MockHandshake, MockTransport, TransportEvent};
pub use traits::{
    HandshakeError, RoomId, Transport, TransportError, TransportResult, UserId,
};
