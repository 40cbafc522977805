//! Matrix application-service transport
//!
//! Two halves:
//! - an axum listener the homeserver pushes transactions to,
//! - a reqwest client acting as the appservice towards the homeserver
//!   (handshake, bot profile, notices).
//!
//! Event handling is out of scope here: transactions are authenticated and
//! acknowledged so the homeserver does not queue them up.

use super::retry::{is_transport_error_retryable, retry_with_backoff};
use super::traits::*;
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::put;
use axum::{Json, Router};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings the transport needs from the operator config
#[derive(Debug, Clone)]
pub struct AppserviceConfig {
    /// Client-server API base URL of the homeserver
    pub homeserver_url: String,
    /// Server name used in user IDs
    pub domain: String,
    pub as_token: String,
    pub hs_token: String,
    pub bot_localpart: String,
    pub bot_displayname: Option<String>,
}

/// Appservice transport backed by HTTP
pub struct AppserviceTransport {
    config: AppserviceConfig,
    homeserver: Url,
    bot: UserId,
    http: reqwest::Client,
    ready: Arc<AtomicBool>,
    txn_counter: AtomicU64,
    server: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<std::io::Result<()>>,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixErrorBody {
    errcode: Option<String>,
    error: Option<String>,
}

impl AppserviceTransport {
    pub fn new(config: AppserviceConfig) -> TransportResult<Self> {
        let homeserver = Url::parse(&config.homeserver_url).map_err(|e| {
            TransportError::Config(format!(
                "invalid homeserver address '{}': {}",
                config.homeserver_url, e
            ))
        })?;
        if homeserver.cannot_be_a_base() {
            return Err(TransportError::Config(format!(
                "homeserver address '{}' is not a base URL",
                config.homeserver_url
            )));
        }

        let http = reqwest::Client::builder()
            .user_agent(format!("courier/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Config(format!("failed to build HTTP client: {e}")))?;

        let bot = UserId(format!("@{}:{}", config.bot_localpart, config.domain));

        Ok(Self {
            config,
            homeserver,
            bot,
            http,
            ready: Arc::new(AtomicBool::new(false)),
            txn_counter: AtomicU64::new(0),
            server: Mutex::new(None),
        })
    }

    /// Address the listener is bound to, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// Call the homeserver client-server API as the appservice.
    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> TransportResult<Value> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Config("homeserver address is not a base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.as_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| TransportError::InvalidResponse(e.to_string()));
        }

        let body: MatrixErrorBody = serde_json::from_str(&text).unwrap_or_default();
        Err(TransportError::Matrix {
            status: status.as_u16(),
            errcode: body.errcode.unwrap_or_else(|| "M_UNKNOWN".to_string()),
            message: body.error.unwrap_or(text),
        })
    }

    fn next_txn_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let counter = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("courier-{millis}-{counter}")
    }
}

/// Map a homeserver error seen during the handshake to its verdict.
pub fn classify_handshake_error(err: TransportError) -> HandshakeError {
    match err.errcode() {
        Some("M_UNKNOWN_TOKEN") => HandshakeError::TokenRejected,
        Some("M_EXCLUSIVE") => HandshakeError::ExclusivityRejected,
        _ => HandshakeError::Transport(err),
    }
}

#[async_trait]
impl Transport for AppserviceTransport {
    async fn start(&self, addr: SocketAddr) -> TransportResult<()> {
        let mut server = self.server.lock().await;
        if let Some(running) = server.as_ref() {
            warn!(addr = %running.local_addr, "Appservice listener already running");
            return Ok(());
        }

        debug!("Starting appservice...");
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr,
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        let app = router(ListenerState {
            hs_token: Arc::from(self.config.hs_token.as_str()),
            ready: self.ready.clone(),
        });
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await
        });

        info!(%local_addr, "Appservice listening");
        *server = Some(RunningServer {
            local_addr,
            shutdown,
            handle,
        });
        Ok(())
    }

    async fn stop(&self) -> TransportResult<()> {
        self.ready.store(false, Ordering::Release);
        let Some(running) = self.server.lock().await.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        match running.handle.await {
            Ok(Ok(())) => {
                info!(addr = %running.local_addr, "Appservice listener stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Network(format!("listener failed: {e}"))),
            Err(e) => Err(TransportError::Network(format!("listener task failed: {e}"))),
        }
    }

    async fn wait_for_connection(&self) -> Result<(), HandshakeError> {
        info!(homeserver = %self.homeserver, "Waiting for connection to homeserver");

        let versions = retry_with_backoff(
            || self.call(Method::GET, &["_matrix", "client", "versions"], &[], None),
            is_transport_error_retryable,
        )
        .await?;
        debug!(versions = %versions["versions"], "Homeserver is reachable");

        let registration = self
            .call(
                Method::POST,
                &["_matrix", "client", "v3", "register"],
                &[],
                Some(json!({
                    "type": "m.login.application_service",
                    "username": self.config.bot_localpart,
                })),
            )
            .await;
        match registration {
            Ok(_) => info!(bot = %self.bot, "Registered bridge bot"),
            Err(e) if e.errcode() == Some("M_USER_IN_USE") => {
                debug!(bot = %self.bot, "Bridge bot already registered")
            }
            Err(e) => return Err(classify_handshake_error(e)),
        }

        self.call(
            Method::GET,
            &["_matrix", "client", "v3", "account", "whoami"],
            &[("user_id", self.bot.as_str())],
            None,
        )
        .await
        .map_err(classify_handshake_error)?;

        info!("Connected to homeserver");
        Ok(())
    }

    async fn init_as_bot(&self) -> TransportResult<()> {
        let Some(displayname) = self.config.bot_displayname.as_deref() else {
            return Ok(());
        };

        self.call(
            Method::PUT,
            &["_matrix", "client", "v3", "profile", self.bot.as_str(), "displayname"],
            &[],
            Some(json!({ "displayname": displayname })),
        )
        .await?;
        debug!(bot = %self.bot, displayname, "Set bridge bot display name");
        Ok(())
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    async fn send_notice(&self, room: &RoomId, text: &str) -> TransportResult<()> {
        let txn_id = self.next_txn_id();
        self.call(
            Method::PUT,
            &[
                "_matrix",
                "client",
                "v3",
                "rooms",
                room.as_str(),
                "send",
                "m.room.message",
                txn_id.as_str(),
            ],
            &[],
            Some(json!({ "msgtype": "m.notice", "body": text })),
        )
        .await?;
        Ok(())
    }

    fn bot_user_id(&self) -> &UserId {
        &self.bot
    }
}

#[derive(Clone)]
struct ListenerState {
    hs_token: Arc<str>,
    ready: Arc<AtomicBool>,
}

impl ListenerState {
    fn authorized(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let token = bearer.or_else(|| query.get("access_token").map(String::as_str));
        token == Some(&*self.hs_token)
    }
}

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<Value>,
}

fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/_matrix/app/v1/transactions/:txn_id", put(handle_transaction))
        .route("/transactions/:txn_id", put(handle_transaction))
        .with_state(state)
}

async fn handle_transaction(
    State(state): State<ListenerState>,
    Path(txn_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(txn): Json<Transaction>,
) -> (StatusCode, Json<Value>) {
    if !state.authorized(&headers, &query) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "errcode": "M_FORBIDDEN", "error": "Invalid hs_token" })),
        );
    }
    if !state.ready.load(Ordering::Acquire) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "errcode": "M_UNKNOWN", "error": "Bridge is starting up" })),
        );
    }

    debug!(txn_id, events = txn.events.len(), "Received transaction");
    (StatusCode::OK, Json(json!({})))
}
