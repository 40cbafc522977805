//! Bridge user
//!
//! One `User` per Matrix user that talks to the bridge. Instances are only
//! ever created by [`UserCache`](super::cache::UserCache), which keeps them
//! unique per `mxid` and per `courpk`.

use crate::matrix::{RoomId, UserId};
use crate::service::{ConnectorError, ConnectorFactory, ConnectorResult, ServiceConnector};
use crate::store::{SessionState, UserRow};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Default)]
struct Account {
    courpk: Option<i64>,
    state: Option<SessionState>,
    notice_room: Option<RoomId>,
}

pub struct User {
    mxid: UserId,
    account: RwLock<Account>,
    connector: RwLock<Option<Arc<dyn ServiceConnector>>>,
}

impl User {
    /// Build from a persisted row, attaching a connector if logged in.
    pub(crate) fn from_row(row: UserRow, connectors: &dyn ConnectorFactory) -> Self {
        let connector = match (row.courpk, row.state.as_ref()) {
            (Some(courpk), Some(state)) => Some(connectors.connector(courpk, state)),
            _ => None,
        };

        Self {
            mxid: row.mxid,
            account: RwLock::new(Account {
                courpk: row.courpk,
                state: row.state,
                notice_room: row.notice_room,
            }),
            connector: RwLock::new(connector),
        }
    }

    pub fn mxid(&self) -> &UserId {
        &self.mxid
    }

    pub fn courpk(&self) -> Option<i64> {
        self.account().courpk
    }

    pub fn notice_room(&self) -> Option<RoomId> {
        self.account().notice_room
    }

    pub fn is_logged_in(&self) -> bool {
        let account = self.account();
        account.courpk.is_some() && account.state.is_some()
    }

    /// Runtime connection state, derived from the live connector
    pub fn is_connected(&self) -> bool {
        self.connector()
            .map(|connector| connector.is_connected())
            .unwrap_or(false)
    }

    pub fn connector(&self) -> Option<Arc<dyn ServiceConnector>> {
        self.connector
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reconnect to the external service.
    pub async fn refresh(&self, resync: bool) -> ConnectorResult<()> {
        let connector = self.connector().ok_or(ConnectorError::NotLoggedIn)?;
        connector.refresh(resync).await
    }

    /// Stop the external session, if there is one.
    pub async fn stop(&self) -> ConnectorResult<()> {
        match self.connector() {
            Some(connector) => connector.stop().await,
            None => Ok(()),
        }
    }

    /// Snapshot for persistence
    pub fn to_row(&self) -> UserRow {
        let account = self.account();
        UserRow {
            mxid: self.mxid.clone(),
            courpk: account.courpk,
            state: account.state,
            notice_room: account.notice_room,
        }
    }

    /// Detach the live connector, leaving the account fields untouched.
    pub(crate) fn take_connector(&self) -> Option<Arc<dyn ServiceConnector>> {
        self.connector
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn set_account(
        &self,
        courpk: i64,
        state: SessionState,
        connector: Arc<dyn ServiceConnector>,
    ) {
        {
            let mut account = self.account.write().unwrap_or_else(PoisonError::into_inner);
            account.courpk = Some(courpk);
            account.state = Some(state);
        }
        *self.connector.write().unwrap_or_else(PoisonError::into_inner) = Some(connector);
    }

    fn account(&self) -> Account {
        self.account
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let account = self.account();
        f.debug_struct("User")
            .field("mxid", &self.mxid)
            .field("courpk", &account.courpk)
            .field("notice_room", &account.notice_room)
            .field("connected", &self.is_connected())
            .finish()
    }
}
