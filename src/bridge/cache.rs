//! Identity cache
//!
//! In-memory registry of bridge users with two indexes: by Matrix user ID
//! (`mxid`) and by external account (`courpk`).
//!
//! Invariants:
//! - at most one `Arc<User>` per `mxid`, and at most one per `courpk`;
//!   both indexes point at the same instance for a logged-in user
//! - ghost user IDs never get a `User`
//!
//! Every load-or-create runs inside a per-key critical section (one async
//! mutex per key, created on first use and kept for the cache's lifetime), so
//! concurrent lookups for the same key see exactly one store round trip while
//! different keys never wait on each other. The index maps themselves are only
//! touched in short synchronous sections, never across an `.await`.

use super::user::User;
use crate::matrix::{GhostNamespace, UserId};
use crate::service::ConnectorFactory;
use crate::store::{SessionState, StoreError, UserRow, UserStore};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("External account {courpk} is already bridged to {owner}")]
    AccountInUse { courpk: i64, owner: UserId },
}

/// Lock table: one async mutex per key
struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let handle = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone();
        handle.lock_owned().await
    }
}

#[derive(Default)]
struct Indexes {
    by_mxid: HashMap<UserId, Arc<User>>,
    by_courpk: HashMap<i64, Arc<User>>,
}

/// Concurrency-safe identity map over bridge users
pub struct UserCache {
    store: Arc<dyn UserStore>,
    connectors: Arc<dyn ConnectorFactory>,
    ghosts: GhostNamespace,
    indexes: RwLock<Indexes>,
    mxid_locks: KeyedLocks<UserId>,
    courpk_locks: KeyedLocks<i64>,
}

impl UserCache {
    pub fn new(
        store: Arc<dyn UserStore>,
        connectors: Arc<dyn ConnectorFactory>,
        ghosts: GhostNamespace,
    ) -> Self {
        Self {
            store,
            connectors,
            ghosts,
            indexes: RwLock::new(Indexes::default()),
            mxid_locks: KeyedLocks::new(),
            courpk_locks: KeyedLocks::new(),
        }
    }

    /// Get the user for `mxid`, loading it from the store or (with `create`)
    /// creating and persisting a new one.
    ///
    /// Ghost user IDs always return `None`.
    pub async fn get_by_mxid(&self, mxid: &UserId, create: bool) -> CacheResult<Option<Arc<User>>> {
        let _section = self.mxid_locks.lock(mxid).await;

        if self.ghosts.contains(mxid) {
            return Ok(None);
        }
        if let Some(user) = self.cached_by_mxid(mxid) {
            return Ok(Some(user));
        }

        if let Some(row) = self.store.get_by_mxid(mxid).await? {
            return Ok(Some(self.add_to_cache(row)));
        }

        if !create {
            return Ok(None);
        }

        let row = UserRow::new(mxid.clone());
        self.store.insert(&row).await?;
        debug!(mxid = %mxid, "Created bridge user");
        Ok(Some(self.add_to_cache(row)))
    }

    /// Get the user logged in as external account `courpk`. Never creates.
    pub async fn get_by_courpk(&self, courpk: i64) -> CacheResult<Option<Arc<User>>> {
        let _section = self.courpk_locks.lock(&courpk).await;

        if let Some(user) = self.cached_by_courpk(courpk) {
            return Ok(Some(user));
        }

        Ok(self
            .store
            .get_by_courpk(courpk)
            .await?
            .map(|row| self.add_to_cache(row)))
    }

    /// Every user eligible for reconnection (account and session present).
    ///
    /// Users already in the cache are returned as the cached instance, never
    /// as a second copy built from the fresh row.
    pub async fn all_logged_in(&self) -> CacheResult<Vec<Arc<User>>> {
        let rows = self.store.all_logged_in().await?;
        let mut users = Vec::with_capacity(rows.len());

        for row in rows {
            if let Some(user) = self.cached_by_mxid(&row.mxid) {
                users.push(user);
                continue;
            }

            let _section = self.mxid_locks.lock(&row.mxid).await;
            users.push(self.add_to_cache(row));
        }

        Ok(users)
    }

    /// Record a successful external login for `user`.
    ///
    /// Persists the account, stores it on the instance and indexes the
    /// instance under `courpk`.
    pub async fn attach_account(
        &self,
        user: &Arc<User>,
        courpk: i64,
        state: SessionState,
    ) -> CacheResult<()> {
        let _section = self.courpk_locks.lock(&courpk).await;

        if let Some(owner) = self.cached_by_courpk(courpk) {
            if !Arc::ptr_eq(&owner, user) {
                return Err(CacheError::AccountInUse {
                    courpk,
                    owner: owner.mxid().clone(),
                });
            }
        }

        let mut row = user.to_row();
        let previous = row.courpk;
        row.courpk = Some(courpk);
        row.state = Some(state.clone());
        self.store.update(&row).await?;

        // The old session must be gone before a new one can start
        if let Some(old) = user.take_connector() {
            if let Err(e) = old.stop().await {
                warn!(mxid = %user.mxid(), error = %e, "Failed to stop previous session");
            }
        }

        let connector = self.connectors.connector(courpk, &state);
        user.set_account(courpk, state, connector);

        let mut indexes = self.write_indexes();
        if let Some(previous) = previous.filter(|previous| *previous != courpk) {
            if indexes
                .by_courpk
                .get(&previous)
                .is_some_and(|owner| Arc::ptr_eq(owner, user))
            {
                indexes.by_courpk.remove(&previous);
            }
        }
        indexes.by_courpk.insert(courpk, user.clone());
        debug!(mxid = %user.mxid(), courpk, "Attached external account");
        Ok(())
    }

    /// Cached logged-in users, ordered by external account.
    pub fn connected_snapshot(&self) -> Vec<Arc<User>> {
        let indexes = self.read_indexes();
        let mut users: Vec<(i64, Arc<User>)> = indexes
            .by_courpk
            .iter()
            .map(|(courpk, user)| (*courpk, user.clone()))
            .collect();
        users.sort_by_key(|(courpk, _)| *courpk);
        users.into_iter().map(|(_, user)| user).collect()
    }

    /// Every cached user.
    pub fn cached_users(&self) -> Vec<Arc<User>> {
        self.read_indexes().by_mxid.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_indexes().by_mxid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ghosts(&self) -> &GhostNamespace {
        &self.ghosts
    }

    fn cached_by_mxid(&self, mxid: &UserId) -> Option<Arc<User>> {
        self.read_indexes().by_mxid.get(mxid).cloned()
    }

    fn cached_by_courpk(&self, courpk: i64) -> Option<Arc<User>> {
        self.read_indexes().by_courpk.get(&courpk).cloned()
    }

    /// Insert a freshly loaded row, returning the canonical instance.
    fn add_to_cache(&self, row: UserRow) -> Arc<User> {
        let mut indexes = self.write_indexes();
        if let Some(existing) = indexes.by_mxid.get(&row.mxid) {
            return existing.clone();
        }

        let user = Arc::new(User::from_row(row, self.connectors.as_ref()));
        indexes
            .by_mxid
            .insert(user.mxid().clone(), user.clone());
        if let Some(courpk) = user.courpk() {
            indexes.by_courpk.entry(courpk).or_insert_with(|| user.clone());
        }
        user
    }

    fn read_indexes(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_indexes(&self) -> std::sync::RwLockWriteGuard<'_, Indexes> {
        self.indexes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MockConnectorFactory;
    use crate::store::MemoryUserStore;
    use serde_json::json;
    use std::time::Duration;

    fn cache_with(store: &MemoryUserStore) -> UserCache {
        UserCache::new(
            Arc::new(store.clone()),
            Arc::new(MockConnectorFactory::new()),
            GhostNamespace::new("courier_{userid}", "example.com").unwrap(),
        )
    }

    fn logged_in_row(mxid: &str, courpk: i64) -> UserRow {
        UserRow {
            mxid: UserId::from(mxid),
            courpk: Some(courpk),
            state: Some(SessionState(json!({ "session": courpk }))),
            notice_room: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_instance() {
        let store = MemoryUserStore::new();
        store.set_latency(Duration::from_millis(5));
        let cache = Arc::new(cache_with(&store));
        let mxid = UserId::from("@alice:example.com");

        let lookups = (0..8).map(|_| {
            let cache = cache.clone();
            let mxid = mxid.clone();
            tokio::spawn(async move { cache.get_by_mxid(&mxid, true).await })
        });
        let users: Vec<Arc<User>> = futures::future::join_all(lookups)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().unwrap())
            .collect();

        assert!(users.iter().all(|user| Arc::ptr_eq(user, &users[0])));
        let calls = store.calls();
        assert_eq!(calls.get_by_mxid, 1);
        assert_eq!(calls.insert, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_ghosts_are_never_users() {
        let store = MemoryUserStore::new();
        let cache = cache_with(&store);
        let ghost = UserId::from("@courier_1234:example.com");

        assert!(cache.get_by_mxid(&ghost, true).await.unwrap().is_none());
        assert!(cache.get_by_mxid(&ghost, false).await.unwrap().is_none());
        assert_eq!(store.calls(), Default::default());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_without_create_returns_none() {
        let store = MemoryUserStore::new();
        let cache = cache_with(&store);

        let mxid = UserId::from("@nobody:example.com");
        assert!(cache.get_by_mxid(&mxid, false).await.unwrap().is_none());
        assert_eq!(store.calls().insert, 0);
        assert!(store.row(&mxid).is_none());
    }

    #[tokio::test]
    async fn test_loaded_user_is_cached() {
        let store = MemoryUserStore::new();
        store.put(logged_in_row("@bob:example.com", 3));
        let cache = cache_with(&store);
        let mxid = UserId::from("@bob:example.com");

        let first = cache.get_by_mxid(&mxid, false).await.unwrap().unwrap();
        let second = cache.get_by_mxid(&mxid, false).await.unwrap().unwrap();
        let by_courpk = cache.get_by_courpk(3).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &by_courpk));
        assert_eq!(store.calls().get_by_mxid, 1);
        // Served from the courpk index populated by the mxid load
        assert_eq!(store.calls().get_by_courpk, 0);
    }

    #[tokio::test]
    async fn test_get_by_courpk_never_creates() {
        let store = MemoryUserStore::new();
        let cache = cache_with(&store);

        assert!(cache.get_by_courpk(99).await.unwrap().is_none());
        assert_eq!(store.calls().insert, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_by_courpk_then_mxid_share_instance() {
        let store = MemoryUserStore::new();
        store.put(logged_in_row("@carol:example.com", 4));
        let cache = cache_with(&store);

        let by_courpk = cache.get_by_courpk(4).await.unwrap().unwrap();
        let by_mxid = cache
            .get_by_mxid(&UserId::from("@carol:example.com"), true)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&by_courpk, &by_mxid));
        assert_eq!(store.calls().get_by_mxid, 0);
    }

    #[tokio::test]
    async fn test_all_logged_in_prefers_cached_instances() {
        let store = MemoryUserStore::new();
        store.put(logged_in_row("@dave:example.com", 1));
        store.put(logged_in_row("@erin:example.com", 2));
        let cache = cache_with(&store);

        let dave = cache
            .get_by_mxid(&UserId::from("@dave:example.com"), false)
            .await
            .unwrap()
            .unwrap();

        let first = cache.all_logged_in().await.unwrap();
        let second = cache.all_logged_in().await.unwrap();

        assert_eq!(first.len(), 2);
        assert!(first.iter().any(|user| Arc::ptr_eq(user, &dave)));
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert_eq!(cache.connected_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = MemoryUserStore::new();
        store.set_failing(true);
        let cache = cache_with(&store);

        let result = cache
            .get_by_mxid(&UserId::from("@frank:example.com"), true)
            .await;
        assert!(matches!(result, Err(CacheError::Store(_))));
        assert!(matches!(cache.get_by_courpk(1).await, Err(CacheError::Store(_))));
        assert!(matches!(cache.all_logged_in().await, Err(CacheError::Store(_))));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_attach_account_indexes_user() {
        let store = MemoryUserStore::new();
        let cache = cache_with(&store);
        let mxid = UserId::from("@grace:example.com");

        let user = cache.get_by_mxid(&mxid, true).await.unwrap().unwrap();
        assert!(cache.connected_snapshot().is_empty());

        cache
            .attach_account(&user, 77, SessionState(json!({ "t": 1 })))
            .await
            .unwrap();

        assert!(user.is_logged_in());
        assert!(user.connector().is_some());
        assert_eq!(store.row(&mxid).unwrap().courpk, Some(77));
        let found = cache.get_by_courpk(77).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &user));
    }

    #[tokio::test]
    async fn test_attach_account_rejects_second_owner() {
        let store = MemoryUserStore::new();
        store.put(logged_in_row("@heidi:example.com", 5));
        let cache = cache_with(&store);

        cache.all_logged_in().await.unwrap();
        let other = cache
            .get_by_mxid(&UserId::from("@ivan:example.com"), true)
            .await
            .unwrap()
            .unwrap();

        let result = cache
            .attach_account(&other, 5, SessionState(json!({})))
            .await;
        assert!(matches!(result, Err(CacheError::AccountInUse { courpk: 5, .. })));
        assert!(!other.is_logged_in());
    }

    #[tokio::test]
    async fn test_attach_account_stops_previous_session() {
        let store = MemoryUserStore::new();
        store.put(logged_in_row("@judy:example.com", 1));
        let factory = MockConnectorFactory::new();
        let cache = UserCache::new(
            Arc::new(store.clone()),
            Arc::new(factory.clone()),
            GhostNamespace::new("courier_{userid}", "example.com").unwrap(),
        );

        let user = cache.get_by_courpk(1).await.unwrap().unwrap();
        user.refresh(false).await.unwrap();
        assert!(factory.connector_for(1).is_connected());

        cache
            .attach_account(&user, 2, SessionState(json!({ "session": 2 })))
            .await
            .unwrap();

        assert_eq!(factory.connector_for(1).stop_calls(), 1);
        assert!(!factory.connector_for(1).is_connected());
        assert!(cache.get_by_courpk(1).await.unwrap().is_none());

        user.stop().await.unwrap();
        assert_eq!(factory.connector_for(2).stop_calls(), 1);
        assert_eq!(factory.connector_for(1).stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_attach_account_survives_failing_stop() {
        let store = MemoryUserStore::new();
        store.put(logged_in_row("@mallory:example.com", 3));
        let factory = MockConnectorFactory::new();
        factory.connector_for(3).fail_stop();
        let cache = UserCache::new(
            Arc::new(store.clone()),
            Arc::new(factory.clone()),
            GhostNamespace::new("courier_{userid}", "example.com").unwrap(),
        );

        let user = cache.get_by_courpk(3).await.unwrap().unwrap();
        cache
            .attach_account(&user, 4, SessionState(json!({})))
            .await
            .unwrap();

        assert_eq!(factory.connector_for(3).stop_calls(), 1);
        let found = cache.get_by_courpk(4).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &user));
    }
}
