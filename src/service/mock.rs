//! Mock external service connectors for testing

use super::traits::*;
use crate::store::SessionState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Failure a mock refresh should produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Network,
    Cancelled,
}

/// Mock connector; clones share state
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockConnectorState>>,
}

#[derive(Default)]
struct MockConnectorState {
    connected: bool,
    refresh_calls: Vec<bool>,
    stop_calls: usize,
    refresh_failure: Option<MockFailure>,
    refresh_delay: Option<Duration>,
    fail_stop: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
    }

    /// Make every following refresh fail
    pub fn fail_refresh(&self, failure: MockFailure) {
        self.state.lock().unwrap().refresh_failure = Some(failure);
    }

    /// Make every following refresh suspend for `delay` first
    pub fn delay_refresh(&self, delay: Duration) {
        self.state.lock().unwrap().refresh_delay = Some(delay);
    }

    pub fn fail_stop(&self) {
        self.state.lock().unwrap().fail_stop = true;
    }

    /// `resync` flag of every refresh call, in order
    pub fn refresh_calls(&self) -> Vec<bool> {
        self.state.lock().unwrap().refresh_calls.clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().unwrap().stop_calls
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }
}

#[async_trait]
impl ServiceConnector for MockConnector {
    async fn refresh(&self, resync: bool) -> ConnectorResult<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.refresh_calls.push(resync);
            state.refresh_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        match state.refresh_failure {
            Some(MockFailure::Network) => {
                state.connected = false;
                Err(ConnectorError::Network("connection reset".to_string()))
            }
            Some(MockFailure::Cancelled) => Err(ConnectorError::Cancelled),
            None => {
                state.connected = true;
                Ok(())
            }
        }
    }

    async fn stop(&self) -> ConnectorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls += 1;
        state.connected = false;
        if state.fail_stop {
            return Err(ConnectorError::Network("disconnect failed".to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        MockConnector::is_connected(self)
    }
}

/// Hands out one shared [`MockConnector`] per account
#[derive(Clone, Default)]
pub struct MockConnectorFactory {
    connectors: Arc<Mutex<HashMap<i64, MockConnector>>>,
}

impl MockConnectorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector for `courpk`, created on first use so tests can configure it
    /// before or after the bridge builds it.
    pub fn connector_for(&self, courpk: i64) -> MockConnector {
        self.connectors
            .lock()
            .unwrap()
            .entry(courpk)
            .or_default()
            .clone()
    }

    /// Number of connectors handed out or configured
    pub fn len(&self) -> usize {
        self.connectors.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectorFactory for MockConnectorFactory {
    fn connector(&self, courpk: i64, _state: &SessionState) -> Arc<dyn ServiceConnector> {
        Arc::new(self.connector_for(courpk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_refresh_connects_and_records() {
        let connector = MockConnector::new();
        assert!(!connector.is_connected());

        connector.refresh(true).await.unwrap();
        assert!(connector.is_connected());
        assert_eq!(connector.refresh_calls(), vec![true]);
    }

    #[tokio::test]
    async fn test_refresh_failure_disconnects() {
        let connector = MockConnector::new();
        connector.set_connected(true);
        connector.fail_refresh(MockFailure::Network);

        assert!(connector.refresh(false).await.is_err());
        assert!(!connector.is_connected());
    }

    #[test]
    fn test_factory_shares_connector_state() {
        let factory = MockConnectorFactory::new();
        let handle = factory.connector_for(7);
        let built = factory.connector(7, &SessionState(json!({})));

        handle.set_connected(true);
        assert!(built.is_connected());
        assert_eq!(factory.len(), 1);
    }

    mod without_connector_trait {
        use super::super::{MockConnector, MockConnectorFactory};

        #[test]
        fn test_connection_state_readable_from_handles() {
            let factory = MockConnectorFactory::new();
            assert!(!factory.connector_for(3).is_connected());

            factory.connector_for(3).set_connected(true);
            assert!(factory.connector_for(3).is_connected());

            let connector = MockConnector::new();
            assert!(!connector.is_connected());
        }
    }
}
