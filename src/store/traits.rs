//! User persistence trait
//!
//! Row-level access to the `user` table. The bridge treats persistence as
//! fail-fast: every error is returned to the caller, nothing is retried here.

use crate::matrix::{RoomId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Opaque external-service session blob, stored as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState(pub serde_json::Value);

/// One persisted bridge user
#[derive(Debug, Clone, PartialEq)]
pub struct UserRow {
    pub mxid: UserId,
    /// External account ID, `None` until the user logs in
    pub courpk: Option<i64>,
    pub state: Option<SessionState>,
    pub notice_room: Option<RoomId>,
}

impl UserRow {
    /// A fresh, logged-out user
    pub fn new(mxid: UserId) -> Self {
        Self {
            mxid,
            courpk: None,
            state: None,
            notice_room: None,
        }
    }

    /// Both the account and its session are known
    pub fn is_logged_in(&self) -> bool {
        self.courpk.is_some() && self.state.is_some()
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Other(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_mxid(&self, mxid: &UserId) -> StoreResult<Option<UserRow>>;

    async fn get_by_courpk(&self, courpk: i64) -> StoreResult<Option<UserRow>>;

    async fn insert(&self, row: &UserRow) -> StoreResult<()>;

    async fn update(&self, row: &UserRow) -> StoreResult<()>;

    /// Users with both an external account and a session state
    async fn all_logged_in(&self) -> StoreResult<Vec<UserRow>>;
}
