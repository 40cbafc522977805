//! Courier - Matrix bridge runtime
//!
//! Bridges Matrix users to accounts on an external service and keeps their
//! connections alive.
//!
//! Layout:
//! - `matrix`: application-service transport and ghost user namespace
//! - `service`: per-user connectors to the external service
//! - `store`: user persistence
//! - `bridge`: identity cache, reconnect loop and lifecycle

pub mod bridge;
pub mod matrix;
pub mod service;
pub mod store;
