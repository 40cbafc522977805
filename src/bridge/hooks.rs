//! Startup hooks
//!
//! Run in order by [`Bridge::start`](super::lifecycle::Bridge::start) after
//! the handshake and before the bridge is marked ready. A failing hook aborts
//! startup.

use super::cache::{CacheError, UserCache};
use crate::matrix::{Transport, TransportError};
use async_trait::async_trait;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[async_trait]
pub trait StartupHook: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    async fn run(&self, transport: &dyn Transport, cache: &UserCache) -> Result<(), HookError>;
}

/// Load every logged-in user so the `courpk` index is complete before the
/// reconnect loop first looks at it.
///
/// With `connect` set, each loaded user is also asked to connect once;
/// failures are logged and do not fail the hook.
#[derive(Debug, Default)]
pub struct WarmUserCache {
    connect: bool,
}

impl WarmUserCache {
    pub fn new(connect: bool) -> Self {
        Self { connect }
    }
}

#[async_trait]
impl StartupHook for WarmUserCache {
    fn name(&self) -> &'static str {
        "warm user cache"
    }

    async fn run(&self, _transport: &dyn Transport, cache: &UserCache) -> Result<(), HookError> {
        let users = cache.all_logged_in().await?;
        info!(count = users.len(), "Loaded logged-in users");

        if !self.connect {
            return Ok(());
        }
        for user in users {
            if let Err(e) = user.refresh(false).await {
                warn!(mxid = %user.mxid(), error = %e, "Failed to connect user on startup");
            }
        }
        Ok(())
    }
}

/// Set up the bridge bot's profile
#[derive(Debug, Default)]
pub struct InitAppserviceBot;

#[async_trait]
impl StartupHook for InitAppserviceBot {
    fn name(&self) -> &'static str {
        "init appservice bot"
    }

    async fn run(&self, transport: &dyn Transport, _cache: &UserCache) -> Result<(), HookError> {
        transport.init_as_bot().await?;
        debug!(bot = %transport.bot_user_id(), "Bridge bot initialized");
        Ok(())
    }
}

/// Tell every logged-in user, in their notice room, that the bridge is up
#[derive(Debug)]
pub struct ResendBridgeInfo {
    text: String,
}

impl ResendBridgeInfo {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for ResendBridgeInfo {
    fn default() -> Self {
        Self::new(format!(
            "Courier bridge {} is running.",
            env!("CARGO_PKG_VERSION")
        ))
    }
}

#[async_trait]
impl StartupHook for ResendBridgeInfo {
    fn name(&self) -> &'static str {
        "resend bridge info"
    }

    async fn run(&self, transport: &dyn Transport, cache: &UserCache) -> Result<(), HookError> {
        let mut sent = 0usize;
        for user in cache.connected_snapshot() {
            let Some(room) = user.notice_room() else {
                continue;
            };
            transport.send_notice(&room, &self.text).await?;
            sent += 1;
        }
        info!(sent, "Resent bridge info");
        Ok(())
    }
}
