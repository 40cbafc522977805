//! Periodic reconnection
//!
//! The supervisor wakes up every `reconnect.interval` seconds and walks the
//! cache's logged-in users in `courpk` order, asking each connector to
//! reconnect. One user at a time: a slow user delays the rest of the pass but
//! the external service never sees more than one reconnect from us.
//!
//! Failures are per user. Cancellation (the token, or a connector reporting
//! [`ConnectorError::Cancelled`]) ends the loop.

use super::cache::UserCache;
use crate::service::ConnectorError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Intervals below this are accepted with a warning.
pub const LOW_INTERVAL_WARNING_SECS: i64 = 600;

/// `[reconnect]` config section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Seconds between passes; zero or negative disables the supervisor
    pub interval: i64,
    /// Reconnect users whose connector is not currently connected
    pub always: bool,
    /// Ask for a full resync instead of a plain reconnect
    pub resync: bool,
}

impl ReconnectConfig {
    /// Sleep between passes, `None` when disabled.
    pub fn period(&self) -> Option<Duration> {
        u64::try_from(self.interval)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Counts for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed(ScanReport),
    /// Cancelled part way; the report covers users handled before that
    Cancelled(ScanReport),
}

#[derive(Clone)]
pub struct ReconnectSupervisor {
    cache: Arc<UserCache>,
    config: ReconnectConfig,
}

impl ReconnectSupervisor {
    pub fn new(cache: Arc<UserCache>, config: ReconnectConfig) -> Self {
        Self { cache, config }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Run until `cancel` fires. Returns immediately when disabled.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(period) = self.config.period() else {
            debug!(interval = self.config.interval, "Periodic reconnect disabled");
            return;
        };

        if self.config.interval < LOW_INTERVAL_WARNING_SECS {
            warn!(
                interval = %humantime::format_duration(period),
                "Periodic reconnect interval is quite low, the external service may rate limit the bridge"
            );
        }
        info!(
            interval = %humantime::format_duration(period),
            always = self.config.always,
            resync = self.config.resync,
            "Starting periodic reconnect loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            match self.scan(&cancel).await {
                ScanOutcome::Completed(report) => info!(
                    refreshed = report.refreshed,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Periodic reconnect pass finished"
                ),
                ScanOutcome::Cancelled(_) => break,
            }
        }

        debug!("Periodic reconnect loop cancelled");
    }

    /// One pass over the logged-in users.
    pub async fn scan(&self, cancel: &CancellationToken) -> ScanOutcome {
        let mut report = ScanReport::default();

        for user in self.cache.connected_snapshot() {
            if cancel.is_cancelled() {
                return ScanOutcome::Cancelled(report);
            }

            if !user.is_connected() && !self.config.always {
                debug!(mxid = %user.mxid(), "Not reconnecting user: not connected");
                report.skipped += 1;
                continue;
            }

            debug!(mxid = %user.mxid(), resync = self.config.resync, "Reconnecting user");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ScanOutcome::Cancelled(report),
                result = user.refresh(self.config.resync) => result,
            };

            match result {
                Ok(()) => report.refreshed += 1,
                Err(ConnectorError::Cancelled) => return ScanOutcome::Cancelled(report),
                Err(e) => {
                    error!(mxid = %user.mxid(), error = %e, "Error while reconnecting user");
                    report.failed += 1;
                }
            }
        }

        ScanOutcome::Completed(report)
    }

    /// Spawn [`run`](Self::run) as a supervised background task.
    pub fn spawn(self, cancel: CancellationToken) -> SupervisedTask {
        let token = cancel.clone();
        spawn_supervised("periodic reconnect loop", cancel, async move {
            self.run(token).await
        })
    }
}

/// Handle to a task started by [`spawn_supervised`]
///
/// Dropping the handle cancels the task's token without waiting for it.
#[derive(Debug)]
pub struct SupervisedTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SupervisedTask {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task and wait for it to wind down.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            warn!(task = self.name, error = %e, "Supervised task did not shut down cleanly");
        }
    }
}

impl Drop for SupervisedTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn `fut` so that a panic in it is logged instead of propagating.
///
/// The future runs in its own task; a second task waits on it and reports how
/// it ended.
pub fn spawn_supervised<F>(name: &'static str, cancel: CancellationToken, fut: F) -> SupervisedTask
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    let handle = tokio::spawn(async move {
        match inner.await {
            Ok(()) => debug!(task = name, "Background task finished"),
            Err(e) if e.is_panic() => error!(task = name, error = %e, "Fatal error in {name}"),
            Err(_) => debug!(task = name, "Background task aborted"),
        }
    });

    SupervisedTask {
        name,
        cancel,
        handle,
    }
}
