use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use thiserror::Error;

use super::store::{KvStore, StoreError, Versioned};

const WRITE_SCRIPT: &str = r#"
local record_key = KEYS[1]
local version_key = KEYS[2]
local index_key = KEYS[3]

local mode = ARGV[1]
local expected = ARGV[2]
local value = ARGV[3]
local member = ARGV[4]

if mode == "cas" then
  local current = redis.call("HGET", record_key, "version")
  if expected == "" then
    if current then
      return -1
    end
  elseif (not current) or current ~= expected then
    return -1
  end
end

local version = redis.call("INCR", version_key)
redis.call("HSET", record_key, "value", value, "version", tostring(version))
redis.call("ZADD", index_key, 0, member)
return version
"#;

const DELETE_SCRIPT: &str = r#"
local record_key = KEYS[1]
local index_key = KEYS[2]
local member = ARGV[1]

local removed = redis.call("DEL", record_key)
redis.call("ZREM", index_key, member)
return removed
"#;

/// Redis-backed [`KvStore`].
///
/// Each entry is a hash holding the JSON value and its version. A sorted set with
/// equal scores indexes entry keys so prefix listing can use `ZRANGEBYLEX`.
#[derive(Clone, Debug)]
pub struct RedisKvStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl RedisKvStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto-relay".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_record(&self, key: &str) -> String {
        format!("{}:kv:{key}", self.prefix)
    }

    fn key_version(&self) -> String {
        format!("{}:kv_version", self.prefix)
    }

    fn key_index(&self) -> String {
        format!("{}:kv_index", self.prefix)
    }

    async fn write(
        &self,
        key: &str,
        expected: Option<Option<u64>>,
        value: &Value,
    ) -> Result<Option<u64>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let serialized = serde_json::to_string(value)?;
        let (mode, expected) = match expected {
            None => ("set", String::new()),
            Some(None) => ("cas", String::new()),
            Some(Some(version)) => ("cas", version.to_string()),
        };

        let version: i64 = redis::Script::new(WRITE_SCRIPT)
            .key(self.key_record(key))
            .key(self.key_version())
            .key(self.key_index())
            .arg(mode)
            .arg(expected)
            .arg(serialized)
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(u64::try_from(version).ok())
    }

    async fn read(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
    ) -> Result<Option<Versioned<Value>>, RedisStoreError> {
        let (value, version): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.key_record(key))
            .arg("value")
            .arg("version")
            .query_async(conn)
            .await?;
        let (Some(value), Some(version)) = (value, version) else {
            return Ok(None);
        };
        let version = version.parse::<u64>().map_err(|err| RedisStoreError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        })?;
        Ok(Some(Versioned {
            value: serde_json::from_str(&value)?,
            version,
        }))
    }

    pub async fn get_entry(&self, key: &str) -> Result<Option<Versioned<Value>>, RedisStoreError> {
        let mut conn = self.connection().await?;
        self.read(&mut conn, key).await
    }

    pub async fn delete_entry(&self, key: &str) -> Result<bool, RedisStoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(DELETE_SCRIPT)
            .key(self.key_record(key))
            .key(self.key_index())
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    pub async fn list_entries(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, Versioned<Value>)>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let min = format!("[{prefix}");
        let max = if prefix.is_empty() {
            "+".to_string()
        } else {
            format!("[{prefix}\u{10FFFF}")
        };
        let members: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(self.key_index())
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await?;

        let mut entries = Vec::with_capacity(members.len());
        for member in members {
            if !member.starts_with(prefix) {
                continue;
            }
            // The index can briefly name an entry deleted by another writer.
            if let Some(entry) = self.read(&mut conn, &member).await? {
                entries.push((member, entry));
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        Ok(self.get_entry(key).await?)
    }

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        let version = self.write(key, None, &value).await?;
        version.ok_or_else(|| StoreError::Backend {
            message: format!("redis write for {key} was not applied"),
        })
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
        Ok(self.write(key, Some(expected), &value).await?.is_some())
    }
}
