//! Bridge core
//!
//! - [`UserCache`]: identity map of bridge users
//! - [`ReconnectSupervisor`]: periodic reconnection of logged-in users
//! - [`Bridge`]: startup and shutdown sequencing

pub mod cache;
pub mod hooks;
pub mod lifecycle;
pub mod supervisor;
pub mod user;

pub use cache::{CacheError, CacheResult, UserCache};
pub use hooks::{HookError, InitAppserviceBot, ResendBridgeInfo, StartupHook, WarmUserCache};
pub use lifecycle::{Bridge, BridgeError, FATAL_HANDSHAKE_EXIT_CODE};
pub use supervisor::{
    spawn_supervised, ReconnectConfig, ReconnectSupervisor, ScanOutcome, ScanReport,
    SupervisedTask, LOW_INTERVAL_WARNING_SECS,
};
pub use user::User;
