use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde_json::Value;
use thiserror::Error;

use super::store::{KvStore, StoreError, Versioned};

/// SQLite-backed [`KvStore`]. Every write bumps a single store-wide version sequence.
#[derive(Clone, Debug)]
pub struct SqliteKvStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

type Entry = (String, Versioned<Value>);

impl SqliteKvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn run<T, F>(&self, op: F) -> Result<T, SqliteStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, SqliteStoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }

    pub async fn get_entry(&self, key: &str) -> Result<Option<Versioned<Value>>, SqliteStoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value_json, version FROM kv WHERE key = ?1",
                    [&key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            row.map(decode_entry).transpose()
        })
        .await
    }

    pub async fn set_entry(&self, key: &str, value: Value) -> Result<u64, SqliteStoreError> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = next_version(&tx)?;
            upsert(&tx, &key, &raw, version)?;
            tx.commit()?;
            Ok(i64_to_u64(version))
        })
        .await
    }

    pub async fn delete_entry(&self, key: &str) -> Result<bool, SqliteStoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM kv WHERE key = ?1", [&key])?;
            Ok(removed > 0)
        })
        .await
    }

    pub async fn list_entries(&self, prefix: &str) -> Result<Vec<Entry>, SqliteStoreError> {
        let prefix = prefix.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value_json, version FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key",
            )?;
            let rows = stmt.query_map([&prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, raw, version) = row?;
                entries.push((key, decode_entry((raw, version))?));
            }
            Ok(entries)
        })
        .await
    }

    pub async fn compare_and_set_entry(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<bool, SqliteStoreError> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = tx
                .query_row("SELECT version FROM kv WHERE key = ?1", [&key], |row| {
                    row.get::<_, i64>(0)
                })
                .optional()?
                .map(i64_to_u64);
            if current != expected {
                return Ok(false);
            }
            let version = next_version(&tx)?;
            upsert(&tx, &key, &raw, version)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        Ok(self.get_entry(key).await?)
    }

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        Ok(self.set_entry(key, value).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.delete_entry(key).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Value>)>, StoreError> {
        Ok(self.list_entries(prefix).await?)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<bool, StoreError> {
        Ok(self.compare_and_set_entry(key, expected, value).await?)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY NOT NULL,
            value_json TEXT NOT NULL,
            version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            value INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO kv_version (id, value) VALUES (1, 0);",
    )
}

fn next_version(tx: &rusqlite::Transaction<'_>) -> Result<i64, rusqlite::Error> {
    tx.query_row(
        "UPDATE kv_version SET value = value + 1 WHERE id = 1 RETURNING value",
        [],
        |row| row.get::<_, i64>(0),
    )
}

fn upsert(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
    raw: &str,
    version: i64,
) -> Result<(), rusqlite::Error> {
    tx.execute(
        "INSERT INTO kv (key, value_json, version) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, version = excluded.version",
        rusqlite::params![key, raw, version],
    )?;
    Ok(())
}

fn decode_entry((raw, version): (String, i64)) -> Result<Versioned<Value>, SqliteStoreError> {
    Ok(Versioned {
        value: serde_json::from_str(&raw)?,
        version: i64_to_u64(version),
    })
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
