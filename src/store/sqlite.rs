//! SQLite user store
//!
//! Holds the bridge's own rows only (`courier.db`). The schema is created on
//! connect; there is no migration history yet.

use super::traits::*;
use crate::matrix::{RoomId, UserId};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

const USER_COLUMNS: &str = "mxid, courpk, state, notice_room";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS "user" (
    mxid        TEXT PRIMARY KEY,
    courpk      INTEGER UNIQUE,
    state       TEXT,
    notice_room TEXT
)
"#;

/// SQLite-backed user store
#[derive(Debug, Clone)]
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    /// Open (creating if needed) the database at `url`, e.g. `sqlite:courier.db`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        Self::connect_with_options(url, 5).await
    }

    pub async fn connect_with_options(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_user(row: &SqliteRow) -> StoreResult<UserRow> {
    let state: Option<String> = row.try_get("state")?;
    let state = state
        .map(|raw| serde_json::from_str(&raw).map(SessionState))
        .transpose()?;

    Ok(UserRow {
        mxid: UserId(row.try_get("mxid")?),
        courpk: row.try_get("courpk")?,
        state,
        notice_room: row.try_get::<Option<String>, _>("notice_room")?.map(RoomId),
    })
}

fn state_json(row: &UserRow) -> StoreResult<Option<String>> {
    Ok(row
        .state
        .as_ref()
        .map(|state| serde_json::to_string(&state.0))
        .transpose()?)
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn get_by_mxid(&self, mxid: &UserId) -> StoreResult<Option<UserRow>> {
        let query = format!(r#"SELECT {USER_COLUMNS} FROM "user" WHERE mxid = ?1"#);
        sqlx::query(&query)
            .bind(mxid.as_str())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_user)
            .transpose()
    }

    async fn get_by_courpk(&self, courpk: i64) -> StoreResult<Option<UserRow>> {
        let query = format!(r#"SELECT {USER_COLUMNS} FROM "user" WHERE courpk = ?1"#);
        sqlx::query(&query)
            .bind(courpk)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(row_to_user)
            .transpose()
    }

    async fn insert(&self, row: &UserRow) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO "user" (mxid, courpk, state, notice_room) VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(row.mxid.as_str())
        .bind(row.courpk)
        .bind(state_json(row)?)
        .bind(row.notice_room.as_ref().map(RoomId::as_str))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, row: &UserRow) -> StoreResult<()> {
        sqlx::query(r#"UPDATE "user" SET courpk = ?2, state = ?3, notice_room = ?4 WHERE mxid = ?1"#)
            .bind(row.mxid.as_str())
            .bind(row.courpk)
            .bind(state_json(row)?)
            .bind(row.notice_room.as_ref().map(RoomId::as_str))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_logged_in(&self) -> StoreResult<Vec<UserRow>> {
        let query = format!(
            r#"SELECT {USER_COLUMNS} FROM "user" WHERE courpk IS NOT NULL AND state IS NOT NULL"#
        );
        sqlx::query(&query)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_user)
            .collect()
    }
}
