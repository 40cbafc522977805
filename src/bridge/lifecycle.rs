//! Bridge lifecycle
//!
//! Start: transport up, handshake, startup hooks, ready, reconnect loop.
//! Stop: reconnect loop, per-user sessions, transport.
//!
//! A rejected handshake (bad `as_token`, or the bot outside the exclusive
//! namespace) is fatal; callers exit with [`FATAL_HANDSHAKE_EXIT_CODE`].

use super::cache::UserCache;
use super::hooks::{HookError, StartupHook};
use super::supervisor::{ReconnectConfig, ReconnectSupervisor, SupervisedTask};
use crate::matrix::{HandshakeError, Transport, TransportError};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Exit status for both fatal handshake rejections.
pub const FATAL_HANDSHAKE_EXIT_CODE: i32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Handshake with homeserver failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Startup hook '{name}' failed: {source}")]
    Hook {
        name: &'static str,
        #[source]
        source: HookError,
    },
}

impl BridgeError {
    pub fn is_fatal_handshake(&self) -> bool {
        matches!(self, Self::Handshake(e) if e.is_fatal())
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal_handshake() {
            FATAL_HANDSHAKE_EXIT_CODE
        } else {
            1
        }
    }
}

pub struct Bridge {
    transport: Arc<dyn Transport>,
    cache: Arc<UserCache>,
    hooks: Vec<Box<dyn StartupHook>>,
    reconnect: ReconnectConfig,
    listen: SocketAddr,
    supervisor: Option<SupervisedTask>,
}

impl Bridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<UserCache>,
        listen: SocketAddr,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            transport,
            cache,
            hooks: Vec::new(),
            reconnect,
            listen,
            supervisor: None,
        }
    }

    /// Append a startup hook; hooks run in the order they were added.
    pub fn with_hook(mut self, hook: impl StartupHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn cache(&self) -> &Arc<UserCache> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether the reconnect loop has been launched and not yet stopped
    pub fn is_supervising(&self) -> bool {
        self.supervisor.is_some()
    }

    /// Bring the bridge up.
    ///
    /// On a fatal handshake rejection nothing after the handshake runs and the
    /// transport is left as is; the process is expected to exit right away.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        debug!(addr = %self.listen, "Starting transport");
        self.transport.start(self.listen).await?;

        info!("Checking connection to homeserver");
        if let Err(e) = self.transport.wait_for_connection().await {
            match &e {
                HandshakeError::TokenRejected => error!(
                    "The as_token was not accepted. Is the registration file installed in your homeserver correctly?"
                ),
                HandshakeError::ExclusivityRejected => error!(
                    "The as_token was accepted, but the /register request was not. \
                     Are the homeserver domain and username template in the config correct, \
                     and do they match the values in the registration?"
                ),
                HandshakeError::Transport(err) => {
                    error!(error = %err, "Failed to connect to homeserver");
                    self.stop_transport().await;
                }
            }
            return Err(e.into());
        }

        for hook in &self.hooks {
            debug!(hook = hook.name(), "Running startup hook");
            if let Err(source) = hook.run(self.transport.as_ref(), &self.cache).await {
                error!(hook = hook.name(), error = %source, "Startup hook failed");
                self.stop_transport().await;
                return Err(BridgeError::Hook {
                    name: hook.name(),
                    source,
                });
            }
        }

        self.transport.set_ready(true);

        let supervisor = ReconnectSupervisor::new(self.cache.clone(), self.reconnect);
        self.supervisor = Some(supervisor.spawn(CancellationToken::new()));

        info!(bot = %self.transport.bot_user_id(), "Bridge started");
        Ok(())
    }

    /// Bring the bridge down. Safe after a partial start, and safe to repeat.
    pub async fn stop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            debug!(task = supervisor.name(), "Stopping reconnect loop");
            supervisor.shutdown().await;
        }

        let users: Vec<_> = self
            .cache
            .cached_users()
            .into_iter()
            .filter(|user| user.connector().is_some())
            .collect();
        debug!(count = users.len(), "Stopping external sessions");

        let results = join_all(users.iter().map(|user| user.stop())).await;
        for (user, result) in users.iter().zip(results) {
            if let Err(e) = result {
                warn!(mxid = %user.mxid(), error = %e, "Failed to stop external session");
            }
        }

        self.stop_transport().await;
        info!("Bridge stopped");
    }

    async fn stop_transport(&self) {
        self.transport.set_ready(false);
        if let Err(e) = self.transport.stop().await {
            warn!(error = %e, "Failed to stop transport");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{GhostNamespace, MockHandshake, MockTransport, TransportEvent, UserId};
    use crate::service::MockConnectorFactory;
    use crate::store::MemoryUserStore;

    fn addr() -> SocketAddr {
        "127.0.0.1:29330".parse().unwrap()
    }

    fn bridge(transport: &MockTransport) -> Bridge {
        let cache = Arc::new(UserCache::new(
            Arc::new(MemoryUserStore::new()),
            Arc::new(MockConnectorFactory::new()),
            GhostNamespace::new("courier_{userid}", "example.com").unwrap(),
        ));
        Bridge::new(
            Arc::new(transport.clone()),
            cache,
            addr(),
            ReconnectConfig::default(),
        )
    }

    #[test]
    fn test_exit_codes() {
        let fatal = BridgeError::from(HandshakeError::TokenRejected);
        assert_eq!(fatal.exit_code(), FATAL_HANDSHAKE_EXIT_CODE);
        let fatal = BridgeError::from(HandshakeError::ExclusivityRejected);
        assert_eq!(fatal.exit_code(), FATAL_HANDSHAKE_EXIT_CODE);

        let transient = BridgeError::from(HandshakeError::Transport(TransportError::Network(
            "refused".into(),
        )));
        assert_eq!(transient.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let transport = MockTransport::new(UserId::from("@courierbot:example.com"));
        let mut bridge = bridge(&transport);

        bridge.start().await.unwrap();
        assert!(bridge.is_supervising());
        assert!(transport.is_ready());

        bridge.stop().await;
        assert!(!bridge.is_supervising());
        assert!(!transport.is_listening());
        assert_eq!(transport.events().last(), Some(&TransportEvent::Stop));
    }

    #[tokio::test]
    async fn test_unreachable_homeserver_releases_listener() {
        let transport = MockTransport::new(UserId::from("@courierbot:example.com"));
        transport.set_handshake(MockHandshake::Unreachable);
        let mut bridge = bridge(&transport);

        let err = bridge.start().await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(!transport.is_listening());
        assert!(!bridge.is_supervising());
    }

    #[tokio::test]
    async fn test_stop_is_repeatable() {
        let transport = MockTransport::new(UserId::from("@courierbot:example.com"));
        let mut bridge = bridge(&transport);

        bridge.stop().await;
        bridge.stop().await;
        assert!(!transport.is_listening());
    }
}
