use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}, Row};
use tokio::sync::RwLock;

use crate::error::Result;

pub const CURRENT_EXERCISE_KEY: &str = "current_exercise_id";
pub const CURRENT_INTERACTION_KEY: &str = "current_interaction_id";
pub const SESSION_COOKIE_KEY: &str = "session_cookie";
pub const DEMO_KEY: &str = "demo_key";

/// Keys dropped on logout. The demo key survives so the same demo user is
/// reused on the next login.
pub const SESSION_KEYS: [&str; 3] = [SESSION_COOKIE_KEY, CURRENT_EXERCISE_KEY, CURRENT_INTERACTION_KEY];

/// Small persisted key/value space for resume-after-restart pointers.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn clear(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(%url, "session store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("tutor_client");
    std::fs::create_dir_all(&dir).map_err(sqlx::Error::Io)?;
    let path = dir.join("session.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM session_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT INTO session_store (key, value, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at")
            .bind(key)
            .bind(value)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool).await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

pub async fn clear_session(store: &dyn SessionStore) -> Result<()> {
    for key in SESSION_KEYS {
        store.clear(key).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn sqlite_store(dir: &tempfile::TempDir) -> SqliteSessionStore {
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.to_string_lossy());
        SqliteSessionStore::initialize(Some(url)).await.unwrap()
    }

    #[tokio::test]
    async fn set_get_overwrite_clear() {
        let dir = tempdir().unwrap();
        let store = sqlite_store(&dir).await;

        assert_eq!(store.get(CURRENT_EXERCISE_KEY).await.unwrap(), None);
        store.set(CURRENT_EXERCISE_KEY, "e1").await.unwrap();
        store.set(CURRENT_EXERCISE_KEY, "e2").await.unwrap();
        assert_eq!(store.get(CURRENT_EXERCISE_KEY).await.unwrap().as_deref(), Some("e2"));

        store.clear(CURRENT_EXERCISE_KEY).await.unwrap();
        assert_eq!(store.get(CURRENT_EXERCISE_KEY).await.unwrap(), None);
        // clearing a missing key is fine
        store.clear(CURRENT_EXERCISE_KEY).await.unwrap();
    }

    #[tokio::test]
    async fn values_survive_reopen_and_wal_is_on() {
        let dir = tempdir().unwrap();
        {
            let store = sqlite_store(&dir).await;
            store.set(CURRENT_INTERACTION_KEY, "i1").await.unwrap();
            let row = sqlx::query("PRAGMA journal_mode;").fetch_one(store.pool()).await.unwrap();
            let mode: String = row.get(0);
            assert!(mode.eq_ignore_ascii_case("wal"), "journal_mode should be WAL, got {}", mode);
        }
        let reopened = sqlite_store(&dir).await;
        assert_eq!(reopened.get(CURRENT_INTERACTION_KEY).await.unwrap().as_deref(), Some("i1"));
    }

    #[tokio::test]
    async fn logout_keeps_demo_key() {
        let store = MemorySessionStore::new();
        store.set(DEMO_KEY, "k").await.unwrap();
        store.set(SESSION_COOKIE_KEY, "tutor_session=1").await.unwrap();
        store.set(CURRENT_EXERCISE_KEY, "e1").await.unwrap();
        store.set(CURRENT_INTERACTION_KEY, "i1").await.unwrap();

        clear_session(&store).await.unwrap();

        assert_eq!(store.get(DEMO_KEY).await.unwrap().as_deref(), Some("k"));
        for key in SESSION_KEYS {
            assert_eq!(store.get(key).await.unwrap(), None);
        }
    }
}
