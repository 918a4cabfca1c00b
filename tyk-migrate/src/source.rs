//! Key-value source of the records being migrated.

use std::collections::{BTreeMap, BTreeSet};

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::errors::SourceError;
use crate::keys::{Category, FetchKind};
use crate::records::RawValue;

/// Read-only access to the store holding the legacy records.
#[allow(async_fn_in_trait)]
pub trait SourceStore {
    /// All keys starting with `prefix`. Order is unspecified, duplicates are removed.
    async fn list_keys(&mut self, prefix: &str) -> Result<Vec<String>, SourceError>;

    async fn get_string(&mut self, key: &str) -> Result<Option<String>, SourceError>;

    /// Field map under `key`. An empty map is reported as absent.
    async fn get_hash(&mut self, key: &str) -> Result<Option<BTreeMap<String, String>>, SourceError>;

    /// Fetch a key in the shape its category stores it.
    async fn fetch(&mut self, category: Category, key: &str) -> Result<Option<RawValue>, SourceError> {
        match category.fetch_kind() {
            FetchKind::String => Ok(self.get_string(key).await?.map(RawValue::Document)),
            FetchKind::Hash => Ok(self.get_hash(key).await?.map(RawValue::FieldMap)),
        }
    }
}

/// Redis-backed source using cursor scans instead of `KEYS`.
pub struct RedisSource {
    conn: ConnectionManager,
    scan_count: usize,
}

impl RedisSource {
    const DEFAULT_SCAN_COUNT: usize = 500;

    pub async fn connect(redis_url: &str) -> Result<Self, SourceError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scan_count: Self::DEFAULT_SCAN_COUNT,
        }
    }

    /// Hint passed as `COUNT` to each `SCAN` call.
    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }
}

impl SourceStore for RedisSource {
    async fn list_keys(&mut self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut found = BTreeSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(self.scan_count)
                .query_async(&mut self.conn)
                .await?;

            // SCAN may return a key more than once while the keyspace rehashes.
            found.extend(keys);

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(found.into_iter().collect())
    }

    async fn get_string(&mut self, key: &str) -> Result<Option<String>, SourceError> {
        let value: Option<String> = self.conn.get(key).await?;
        Ok(value)
    }

    async fn get_hash(&mut self, key: &str) -> Result<Option<BTreeMap<String, String>>, SourceError> {
        let fields: BTreeMap<String, String> = self.conn.hgetall(key).await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
