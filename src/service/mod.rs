//! External Service Integration
//!
//! Per-user connectors to the external service behind the bridge:
//! - `HttpServiceConnector` talks to the login service over HTTP
//! - `MockConnector` for tests

pub mod http;
pub mod mock;
pub mod traits;

pub use http::{HttpConnectorFactory, HttpServiceConnector};
pub use mock::{MockConnector, MockConnectorFactory, MockFailure};
pub use traits::{ConnectorError, ConnectorFactory, ConnectorResult, ServiceConnector};
