//! In-memory user store for testing
//!
//! Counts every call and can inject latency (to force interleaving between
//! concurrent cache lookups) or failures.

use super::traits::*;
use crate::matrix::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Call counters for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub get_by_mxid: usize,
    pub get_by_courpk: usize,
    pub insert: usize,
    pub update: usize,
    pub all_logged_in: usize,
}

/// In-memory user store
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    rows: HashMap<UserId, UserRow>,
    calls: StoreCalls,
    latency: Option<Duration>,
    failing: bool,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row without counting it as a call
    pub fn put(&self, row: UserRow) {
        self.state.lock().unwrap().rows.insert(row.mxid.clone(), row);
    }

    pub fn row(&self, mxid: &UserId) -> Option<UserRow> {
        self.state.lock().unwrap().rows.get(mxid).cloned()
    }

    pub fn calls(&self) -> StoreCalls {
        self.state.lock().unwrap().calls
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    /// Make every call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Count the call, sleep if configured, then report injected failure
    async fn enter(&self, count: impl FnOnce(&mut StoreCalls)) -> StoreResult<()> {
        let (latency, failing) = {
            let mut state = self.state.lock().unwrap();
            count(&mut state.calls);
            (state.latency, state.failing)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if failing {
            return Err(StoreError::Other("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_mxid(&self, mxid: &UserId) -> StoreResult<Option<UserRow>> {
        self.enter(|calls| calls.get_by_mxid += 1).await?;
        Ok(self.row(mxid))
    }

    async fn get_by_courpk(&self, courpk: i64) -> StoreResult<Option<UserRow>> {
        self.enter(|calls| calls.get_by_courpk += 1).await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .values()
            .find(|row| row.courpk == Some(courpk))
            .cloned())
    }

    async fn insert(&self, row: &UserRow) -> StoreResult<()> {
        self.enter(|calls| calls.insert += 1).await?;
        let mut state = self.state.lock().unwrap();
        if state.rows.contains_key(&row.mxid) {
            return Err(StoreError::Other(format!("duplicate user {}", row.mxid)));
        }
        state.rows.insert(row.mxid.clone(), row.clone());
        Ok(())
    }

    async fn update(&self, row: &UserRow) -> StoreResult<()> {
        self.enter(|calls| calls.update += 1).await?;
        let mut state = self.state.lock().unwrap();
        match state.rows.get_mut(&row.mxid) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => Err(StoreError::Other(format!("unknown user {}", row.mxid))),
        }
    }

    async fn all_logged_in(&self) -> StoreResult<Vec<UserRow>> {
        self.enter(|calls| calls.all_logged_in += 1).await?;
        let state = self.state.lock().unwrap();
        let mut rows: Vec<UserRow> = state
            .rows
            .values()
            .filter(|row| row.is_logged_in())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.mxid.cmp(&b.mxid));
        Ok(rows)
    }
}
