//! HTTP connector to the external login service
//!
//! The login service owns the actual external-service sessions; the bridge
//! asks it to reconnect or disconnect an account:
//!
//! - `POST {api_url}/v1/accounts/{courpk}/reconnect` with `{"resync": bool, "state": ...}`
//! - `POST {api_url}/v1/accounts/{courpk}/disconnect`

use super::traits::*;
use crate::store::SessionState;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Creates [`HttpServiceConnector`]s sharing one HTTP client
#[derive(Debug, Clone)]
pub struct HttpConnectorFactory {
    client: reqwest::Client,
    api_url: Url,
}

impl HttpConnectorFactory {
    pub fn new(api_url: &str, request_timeout: Duration) -> Result<Self, ConnectorError> {
        let api_url = Url::parse(api_url)
            .map_err(|e| ConnectorError::Network(format!("invalid service address '{api_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("courier/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, api_url })
    }
}

impl ConnectorFactory for HttpConnectorFactory {
    fn connector(&self, courpk: i64, state: &SessionState) -> Arc<dyn ServiceConnector> {
        Arc::new(HttpServiceConnector {
            client: self.client.clone(),
            api_url: self.api_url.clone(),
            courpk,
            state: state.clone(),
            connected: AtomicBool::new(false),
        })
    }
}

/// Connector for one account, via the login service
#[derive(Debug)]
pub struct HttpServiceConnector {
    client: reqwest::Client,
    api_url: Url,
    courpk: i64,
    state: SessionState,
    connected: AtomicBool,
}

impl HttpServiceConnector {
    fn account_url(&self, action: &str) -> Result<Url, ConnectorError> {
        let courpk = self.courpk.to_string();
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConnectorError::Network("service address is not a base URL".into()))?
            .pop_if_empty()
            .extend(["v1", "accounts", courpk.as_str(), action]);
        Ok(url)
    }

    async fn post(&self, action: &str, body: serde_json::Value) -> ConnectorResult<()> {
        let response = self
            .client
            .post(self.account_url(action)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConnectorError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(ConnectorError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ServiceConnector for HttpServiceConnector {
    async fn refresh(&self, resync: bool) -> ConnectorResult<()> {
        debug!(courpk = self.courpk, resync, "Refreshing external session");
        let result = self
            .post("reconnect", json!({ "resync": resync, "state": self.state.0 }))
            .await;
        self.connected.store(result.is_ok(), Ordering::Release);
        result
    }

    async fn stop(&self) -> ConnectorResult<()> {
        self.connected.store(false, Ordering::Release);
        self.post("disconnect", json!({})).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> Arc<dyn ServiceConnector> {
        let factory =
            HttpConnectorFactory::new("http://127.0.0.1:1/api/", Duration::from_secs(1)).unwrap();
        factory.connector(42, &SessionState(json!({})))
    }

    #[test]
    fn test_account_url() {
        let connector = HttpServiceConnector {
            client: reqwest::Client::new(),
            api_url: Url::parse("http://login.example.com/api/").unwrap(),
            courpk: 42,
            state: SessionState(json!(null)),
            connected: AtomicBool::new(false),
        };
        assert_eq!(
            connector.account_url("reconnect").unwrap().as_str(),
            "http://login.example.com/api/v1/accounts/42/reconnect"
        );
    }

    #[test]
    fn test_invalid_api_url() {
        assert!(HttpConnectorFactory::new("::not a url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_leaves_disconnected() {
        let connector = connector();
        assert!(!connector.is_connected());

        let err = connector.refresh(true).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Network(_)));
        assert!(!connector.is_connected());
    }
}
