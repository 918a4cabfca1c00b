//! In-process stores used for dry rehearsals and tests.
//!
//! Both stores are cheap handles over shared state, so a test can keep one
//! clone for inspection while the runner owns the other.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::{PersistError, SourceError, TargetError};
use crate::rows::{ColumnValue, UpsertStatement};
use crate::source::SourceStore;
use crate::target::TargetStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    String(String),
    Hash(BTreeMap<String, String>),
}

type FetchHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct SourceState {
    values: BTreeMap<String, StoredValue>,
    failing_keys: BTreeSet<String>,
    failing_prefixes: BTreeSet<String>,
    on_fetch: Option<FetchHook>,
    fetches: usize,
}

/// Source store backed by a shared map.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_string(&self, key: impl Into<String>, value: impl Into<String>) -> &Self {
        lock(&self.state)
            .values
            .insert(key.into(), StoredValue::String(value.into()));
        self
    }

    pub fn insert_hash<K, V>(&self, key: impl Into<String>, fields: impl IntoIterator<Item = (K, V)>) -> &Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        lock(&self.state).values.insert(key.into(), StoredValue::Hash(fields));
        self
    }

    pub fn remove(&self, key: &str) {
        lock(&self.state).values.remove(key);
    }

    /// Make every read of `key` fail.
    pub fn fail_fetch(&self, key: impl Into<String>) {
        lock(&self.state).failing_keys.insert(key.into());
    }

    /// Make listing keys under `prefix` fail.
    pub fn fail_listing(&self, prefix: impl Into<String>) {
        lock(&self.state).failing_prefixes.insert(prefix.into());
    }

    /// Call `hook` with the key before every read.
    pub fn on_fetch<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        lock(&self.state).on_fetch = Some(Arc::new(hook));
    }

    /// Number of reads served so far.
    pub fn fetch_count(&self) -> usize {
        lock(&self.state).fetches
    }

    fn read(&self, key: &str) -> Result<Option<StoredValue>, SourceError> {
        let hook = {
            let mut state = lock(&self.state);
            state.fetches += 1;
            state.on_fetch.clone()
        };
        // The hook runs unlocked so it may touch this store.
        if let Some(hook) = hook {
            hook(key);
        }

        let state = lock(&self.state);
        if state.failing_keys.contains(key) {
            return Err(SourceError::Other {
                message: Cow::Owned(format!("read of {key} failed")),
            });
        }
        Ok(state.values.get(key).cloned())
    }
}

fn wrong_type(key: &str) -> SourceError {
    SourceError::Other {
        message: Cow::Owned(format!("WRONGTYPE {key} holds a different kind of value")),
    }
}

impl SourceStore for MemorySource {
    async fn list_keys(&mut self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let state = lock(&self.state);
        if state.failing_prefixes.contains(prefix) {
            return Err(SourceError::Other {
                message: Cow::Owned(format!("scan of {prefix}* failed")),
            });
        }
        Ok(state
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_string(&mut self, key: &str) -> Result<Option<String>, SourceError> {
        match self.read(key)? {
            Some(StoredValue::String(value)) => Ok(Some(value)),
            Some(StoredValue::Hash(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn get_hash(&mut self, key: &str) -> Result<Option<BTreeMap<String, String>>, SourceError> {
        match self.read(key)? {
            Some(StoredValue::Hash(fields)) if fields.is_empty() => Ok(None),
            Some(StoredValue::Hash(fields)) => Ok(Some(fields)),
            Some(StoredValue::String(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }
}

/// A row as the memory target stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub columns: BTreeMap<String, String>,
    /// Logical clock value of the insert.
    pub created_at: u64,
    /// Logical clock value of the last write.
    pub updated_at: u64,
}

impl StoredRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }
}

type Tables = BTreeMap<String, BTreeMap<String, StoredRow>>;

#[derive(Default)]
struct TargetState {
    committed: Tables,
    /// Working copy of `committed` while a transaction is open.
    staged: Option<Tables>,
    clock: u64,
    rejected: BTreeMap<String, PersistError>,
    fail_commit: bool,
    commits: usize,
    rollbacks: usize,
}

/// Target store with transactional staging and upsert semantics.
///
/// Clones share both the tables and the open/closed status of the handle.
/// `reopen` gives a fresh connection over the same tables.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    state: Arc<Mutex<TargetState>>,
    closed: Arc<AtomicBool>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new open handle over the same tables, like connecting again.
    pub fn reopen(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reject every upsert whose identity is `identity`.
    pub fn reject(&self, identity: impl Into<String>, error: PersistError) {
        lock(&self.state).rejected.insert(identity.into(), error);
    }

    /// Make every following commit fail.
    pub fn fail_commit(&self) {
        lock(&self.state).fail_commit = true;
    }

    /// Committed rows of `table`, ordered by identity.
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        lock(&self.state)
            .committed
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, identity: &str) -> Option<StoredRow> {
        lock(&self.state)
            .committed
            .get(table)
            .and_then(|rows| rows.get(identity).cloned())
    }

    /// Rows written inside the open transaction, if any.
    pub fn staged_rows(&self, table: &str) -> Vec<StoredRow> {
        lock(&self.state)
            .staged
            .as_ref()
            .and_then(|tables| tables.get(table))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn commit_count(&self) -> usize {
        lock(&self.state).commits
    }

    pub fn rollback_count(&self) -> usize {
        lock(&self.state).rollbacks
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TargetStore for MemoryTarget {
    async fn execute(&mut self, statement: &UpsertStatement, params: &[ColumnValue]) -> Result<u64, PersistError> {
        if params.len() != statement.columns.len() {
            return Err(PersistError::new(format!(
                "{} expects {} parameters, got {}",
                statement.table,
                statement.columns.len(),
                params.len()
            )));
        }

        let identity = statement
            .column_index(statement.conflict_column)
            .and_then(|index| params.get(index))
            .map(|value| value.as_str().to_string())
            .ok_or_else(|| PersistError::new(format!("missing {} parameter", statement.conflict_column)))?;

        for param in params {
            if let ColumnValue::Json(raw) = param
                && let Err(err) = serde_json::from_str::<serde_json::Value>(raw)
            {
                return Err(PersistError::with_code(
                    "22P02",
                    format!("invalid input syntax for type json: {err}"),
                ));
            }
        }

        if self.is_closed() {
            return Err(PersistError::new("target is closed"));
        }
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(error) = state.rejected.get(&identity) {
            return Err(error.clone());
        }

        state.clock += 1;
        let now = state.clock;
        let staged = state.staged.get_or_insert_with(|| state.committed.clone());
        let table = staged.entry(statement.table.to_string()).or_default();

        match table.get_mut(&identity) {
            Some(existing) => {
                for column in statement.update_columns {
                    if let Some(value) = statement.column_index(column).and_then(|index| params.get(index)) {
                        existing.columns.insert(column.to_string(), value.as_str().to_string());
                    }
                }
                existing.updated_at = now;
            }
            None => {
                let columns = statement
                    .columns
                    .iter()
                    .zip(params)
                    .map(|(column, value)| (column.name.to_string(), value.as_str().to_string()))
                    .collect();
                table.insert(
                    identity,
                    StoredRow {
                        columns,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        Ok(1)
    }

    async fn commit(&mut self) -> Result<(), TargetError> {
        let mut state = lock(&self.state);
        if state.fail_commit {
            state.staged = None;
            return Err(TargetError::Other {
                message: Cow::Borrowed("commit rejected by target"),
            });
        }
        if let Some(staged) = state.staged.take() {
            state.committed = staged;
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TargetError> {
        let mut state = lock(&self.state);
        state.staged = None;
        state.rollbacks += 1;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.state).staged = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Category;
    use crate::records::RawValue;

    fn text(value: &str) -> ColumnValue {
        ColumnValue::Text(value.to_string())
    }

    fn admin_key_params(id: &str, permissions: &str) -> Vec<ColumnValue> {
        vec![
            text(id),
            text("org"),
            text("hash"),
            ColumnValue::Json(permissions.to_string()),
        ]
    }

    #[tokio::test]
    async fn source_lists_by_prefix() {
        let mut source = MemorySource::new();
        source
            .insert_string("apidef-1", "{}")
            .insert_string("apidef-2", "{}")
            .insert_string("user-1", "{}");

        let keys = source.list_keys("apidef-").await.unwrap();
        assert_eq!(keys, vec!["apidef-1", "apidef-2"]);
    }

    #[tokio::test]
    async fn source_fetch_follows_category_shape() {
        let mut source = MemorySource::new();
        source.insert_hash("cert-a", [("certificate", "PEM")]);
        source.insert_string("user-a", "{}");

        let cert = source.fetch(Category::Certificates, "cert-a").await.unwrap();
        assert!(matches!(cert, Some(RawValue::FieldMap(_))));
        assert!(source.fetch(Category::Certificates, "user-a").await.is_err());
        assert!(source.fetch(Category::PortalUsers, "user-b").await.unwrap().is_none());
        assert_eq!(source.fetch_count(), 3);
    }

    #[tokio::test]
    async fn empty_hash_reads_as_absent() {
        let mut source = MemorySource::new();
        source.insert_hash("cert-empty", Vec::<(String, String)>::new());
        assert!(source.get_hash("cert-empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn target_upsert_updates_only_mutable_columns() {
        let mut target = MemoryTarget::new();
        let statement = UpsertStatement::for_category(Category::AdminKeys);

        target.execute(&statement, &admin_key_params("k1", "{}")).await.unwrap();
        let mut second = admin_key_params("k1", r#"{"a":1}"#);
        second[1] = text("other-org");
        target.execute(&statement, &second).await.unwrap();
        target.commit().await.unwrap();

        let rows = target.rows("tyk_admin_keys");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("org_id"), Some("org"));
        assert_eq!(rows[0].get("permissions"), Some(r#"{"a":1}"#));
        assert!(rows[0].updated_at > rows[0].created_at);
    }

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let mut target = MemoryTarget::new();
        let statement = UpsertStatement::for_category(Category::AdminKeys);

        target.execute(&statement, &admin_key_params("k1", "{}")).await.unwrap();
        assert_eq!(target.staged_rows("tyk_admin_keys").len(), 1);
        target.rollback().await.unwrap();

        assert!(target.rows("tyk_admin_keys").is_empty());
        assert_eq!(target.rollback_count(), 1);
    }

    #[tokio::test]
    async fn rejected_write_keeps_earlier_writes() {
        let mut target = MemoryTarget::new();
        let statement = UpsertStatement::for_category(Category::AdminKeys);
        target.reject("bad", PersistError::with_code("23505", "duplicate key"));

        target.execute(&statement, &admin_key_params("k1", "{}")).await.unwrap();
        let err = target.execute(&statement, &admin_key_params("bad", "{}")).await.unwrap_err();
        assert!(err.is_unique_violation());
        target.commit().await.unwrap();

        assert_eq!(target.rows("tyk_admin_keys").len(), 1);
    }

    #[tokio::test]
    async fn reopened_handle_sees_committed_rows() {
        let mut target = MemoryTarget::new();
        let statement = UpsertStatement::for_category(Category::AdminKeys);
        target.execute(&statement, &admin_key_params("k1", "{}")).await.unwrap();
        target.commit().await.unwrap();
        target.close().await;

        let err = target.execute(&statement, &admin_key_params("k2", "{}")).await.unwrap_err();
        assert_eq!(err.message, "target is closed");

        let mut reopened = target.reopen();
        assert!(target.is_closed());
        assert!(!reopened.is_closed());
        reopened.execute(&statement, &admin_key_params("k2", "{}")).await.unwrap();
        reopened.commit().await.unwrap();
        assert_eq!(target.rows("tyk_admin_keys").len(), 2);
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let mut target = MemoryTarget::new();
        let statement = UpsertStatement::for_category(Category::AdminKeys);
        let err = target
            .execute(&statement, &admin_key_params("k1", "{not json"))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("22P02"));
    }
}
