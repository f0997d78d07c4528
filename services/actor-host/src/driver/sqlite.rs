//! SQLite-backed driver for single-node durable storage.
//!
//! One database holds actor identities, the latest record of every actor,
//! and armed alarms so they can be re-armed after a restart. Optional
//! per-actor databases live as separate files under a directory.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use ember_id::ActorId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{
    ActorDriver, ActorKey, ActorMetadata, ActorRef, AlarmTimers, DatabaseHandle, ManagerDriver,
    StorageError,
};
use crate::clock::Clock;

pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
    timers: AlarmTimers,
    clock: Arc<dyn Clock>,
    databases_dir: Option<PathBuf>,
}

impl SqliteDriver {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn, clock)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?, clock)
    }

    /// Hands out per-actor database files under `dir`.
    ///
    /// The [`DatabaseHandle`] returned by `get_database` is a `PathBuf`.
    pub fn with_databases_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.databases_dir = Some(dir.into());
        self
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timers: AlarmTimers::new(Arc::clone(&clock)),
            clock,
            databases_dir: None,
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&guard).map_err(StorageError::from)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS actors (
            actor_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            actor_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE (name, actor_key)
        );

        CREATE TABLE IF NOT EXISTS actor_records (
            actor_id TEXT PRIMARY KEY REFERENCES actors(actor_id),
            data BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS actor_alarms (
            actor_id TEXT PRIMARY KEY,
            wake_at INTEGER NOT NULL
        );
        "#,
    )?;

    debug!("Actor store schema initialized");
    Ok(())
}

fn encode_key(key: &ActorKey) -> Result<String, StorageError> {
    serde_json::to_string(key).map_err(|e| StorageError::Backend(format!("encode key: {e}")))
}

fn to_metadata(id: String, name: String, key: String) -> Result<ActorMetadata, StorageError> {
    let id = ActorId::parse(&id).map_err(|e| StorageError::Backend(format!("stored id: {e}")))?;
    let key: ActorKey = serde_json::from_str(&key)
        .map_err(|e| StorageError::Backend(format!("stored key: {e}")))?;
    Ok(ActorMetadata { id, name, key })
}

fn to_sql_ts(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[async_trait]
impl ActorDriver for SqliteDriver {
    async fn read_persisted_data(&self, actor_id: &ActorId) -> Result<Option<Bytes>, StorageError> {
        let id = actor_id.to_string();
        let data: Option<Vec<u8>> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT data FROM actor_records WHERE actor_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(data.map(Bytes::from))
    }

    async fn write_persisted_data(&self, actor_id: &ActorId, data: Bytes) -> Result<(), StorageError> {
        let id = actor_id.to_string();
        let now = to_sql_ts(self.clock.now_ms());
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO actor_records (actor_id, data, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(actor_id) DO UPDATE SET
                    data = excluded.data,
                    updated_at = excluded.updated_at
                "#,
                params![id, data.as_ref(), now],
            )
            .map(|_| ())
        })
        .await
    }

    async fn set_alarm(&self, actor_ref: &ActorRef, timestamp_ms: u64) -> Result<(), StorageError> {
        let id = actor_ref.actor_id().to_string();
        let wake_at = to_sql_ts(timestamp_ms);
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO actor_alarms (actor_id, wake_at) VALUES (?1, ?2)
                ON CONFLICT(actor_id) DO UPDATE SET wake_at = excluded.wake_at
                "#,
                params![id, wake_at],
            )
            .map(|_| ())
        })
        .await?;
        self.timers.arm(actor_ref, timestamp_ms);
        Ok(())
    }

    fn supports_sleep(&self) -> bool {
        true
    }

    async fn sleep(&self, actor_ref: &ActorRef) -> Result<(), StorageError> {
        actor_ref.request_stop();
        Ok(())
    }

    async fn get_database(&self, actor_id: &ActorId) -> Result<Option<DatabaseHandle>, StorageError> {
        let Some(dir) = &self.databases_dir else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::Backend(format!("create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{actor_id}.sqlite3"));
        Ok(Some(Arc::new(path)))
    }
}

#[async_trait]
impl ManagerDriver for SqliteDriver {
    async fn get_for_id(&self, actor_id: &ActorId) -> Result<Option<ActorMetadata>, StorageError> {
        let id = actor_id.to_string();
        let row: Option<(String, String, String)> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT actor_id, name, actor_key FROM actors WHERE actor_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })
            .await?;
        row.map(|(id, name, key)| to_metadata(id, name, key))
            .transpose()
    }

    async fn get_for_key(
        &self,
        name: &str,
        key: &ActorKey,
    ) -> Result<Option<ActorMetadata>, StorageError> {
        let name = name.to_string();
        let key = encode_key(key)?;
        let row: Option<(String, String, String)> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT actor_id, name, actor_key FROM actors WHERE name = ?1 AND actor_key = ?2",
                    params![name, key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })
            .await?;
        row.map(|(id, name, key)| to_metadata(id, name, key))
            .transpose()
    }

    async fn create_actor(&self, metadata: &ActorMetadata, initial: Bytes) -> Result<(), StorageError> {
        let id = metadata.id.to_string();
        let name = metadata.name.clone();
        let key = encode_key(&metadata.key)?;
        let now = to_sql_ts(self.clock.now_ms());
        let label = format!("{} {}", metadata.name, metadata.key);

        let inserted = self
            .with_conn(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO actors (actor_id, name, actor_key, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![id, name, key, now],
                )?;
                if inserted == 1 {
                    tx.execute(
                        "INSERT INTO actor_records (actor_id, data, updated_at) VALUES (?1, ?2, ?3)",
                        params![id, initial.as_ref(), now],
                    )?;
                }
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await?;

        if inserted {
            Ok(())
        } else {
            Err(StorageError::AlreadyExists(label))
        }
    }

    async fn pending_alarms(&self) -> Result<Vec<(ActorId, u64)>, StorageError> {
        let rows: Vec<(String, i64)> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT actor_id, wake_at FROM actor_alarms")?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                let collected = rows.collect::<Result<Vec<_>, _>>();
                collected
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, wake_at)| match ActorId::parse(&id) {
                Ok(id) => Some((id, u64::try_from(wake_at).unwrap_or_default())),
                Err(e) => {
                    warn!(actor_id = %id, error = %e, "Skipping alarm with invalid actor id");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio::sync::mpsc;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_000))
    }

    fn metadata() -> ActorMetadata {
        ActorMetadata {
            id: ActorId::new(),
            name: "counter".into(),
            key: ActorKey::new(["tenant", "42"]),
        }
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.db");
        let meta = metadata();

        {
            let driver = SqliteDriver::open(&path, clock()).unwrap();
            driver
                .create_actor(&meta, Bytes::from_static(b"v0"))
                .await
                .unwrap();
            driver
                .write_persisted_data(&meta.id, Bytes::from_static(b"v1"))
                .await
                .unwrap();
        }

        let driver = SqliteDriver::open(&path, clock()).unwrap();
        assert_eq!(
            driver.read_persisted_data(&meta.id).await.unwrap(),
            Some(Bytes::from_static(b"v1"))
        );
        assert_eq!(
            driver.get_for_key("counter", &meta.key).await.unwrap(),
            Some(meta.clone())
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let driver = SqliteDriver::open_in_memory(clock()).unwrap();
        let meta = metadata();
        driver.create_actor(&meta, Bytes::new()).await.unwrap();

        let twin = ActorMetadata {
            id: ActorId::new(),
            ..meta.clone()
        };
        assert!(matches!(
            driver.create_actor(&twin, Bytes::new()).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(driver.get_for_id(&twin.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alarms_are_listed_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ember.db");
        let (tx, _rx) = mpsc::unbounded_channel();
        let actor = ActorRef::new(ActorId::new(), tx);

        {
            let driver = SqliteDriver::open(&path, clock()).unwrap();
            driver.set_alarm(&actor, 5_000).await.unwrap();
            driver.set_alarm(&actor, 4_000).await.unwrap();
        }

        let driver = SqliteDriver::open(&path, clock()).unwrap();
        assert_eq!(
            driver.pending_alarms().await.unwrap(),
            vec![(actor.actor_id(), 4_000)]
        );
    }

    #[tokio::test]
    async fn test_database_handle_is_per_actor_path() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SqliteDriver::open_in_memory(clock())
            .unwrap()
            .with_databases_dir(dir.path().join("actors"));
        let id = ActorId::new();

        let handle = driver.get_database(&id).await.unwrap().unwrap();
        let path = handle.downcast_ref::<PathBuf>().unwrap();
        assert!(path.ends_with(format!("{id}.sqlite3")));
        assert!(dir.path().join("actors").is_dir());
    }
}
