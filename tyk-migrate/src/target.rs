//! Relational target of the migration.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};

use crate::errors::{PersistError, TargetError};
use crate::rows::{ColumnValue, UpsertStatement};

/// Write access to the relational store.
///
/// Writes accumulate in an open transaction until `commit` or `rollback`.
/// A rejected `execute` must leave earlier writes in that transaction intact.
#[allow(async_fn_in_trait)]
pub trait TargetStore {
    /// Run an upsert with positional parameters. Returns the number of affected rows.
    async fn execute(&mut self, statement: &UpsertStatement, params: &[ColumnValue]) -> Result<u64, PersistError>;

    async fn commit(&mut self) -> Result<(), TargetError>;

    async fn rollback(&mut self) -> Result<(), TargetError>;

    async fn close(&mut self);
}

const RECORD_SAVEPOINT: &str = "tyk_migrate_record";

/// PostgreSQL target holding one connection and at most one open transaction.
pub struct PostgresTarget {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTarget {
    pub async fn connect(options: PgConnectOptions) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(1).connect_with(options).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>, sqlx::Error> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.tx.insert(tx))
    }
}

impl TargetStore for PostgresTarget {
    async fn execute(&mut self, statement: &UpsertStatement, params: &[ColumnValue]) -> Result<u64, PersistError> {
        if params.len() != statement.columns.len() {
            return Err(PersistError::new(format!(
                "{} expects {} parameters, got {}",
                statement.table,
                statement.columns.len(),
                params.len()
            )));
        }

        let tx = self.transaction().await?;

        // A failed statement aborts the whole transaction in PostgreSQL, so
        // every record runs under its own savepoint.
        sqlx::query(&format!("SAVEPOINT {RECORD_SAVEPOINT}"))
            .execute(tx.as_mut())
            .await?;

        let mut query = sqlx::query(&statement.sql);
        for param in params {
            query = query.bind(param.as_str());
        }

        match query.execute(tx.as_mut()).await {
            Ok(done) => {
                sqlx::query(&format!("RELEASE SAVEPOINT {RECORD_SAVEPOINT}"))
                    .execute(tx.as_mut())
                    .await?;
                Ok(done.rows_affected())
            }
            Err(error) => {
                // ROLLBACK TO keeps the savepoint open, so release it as well.
                sqlx::query(&format!("ROLLBACK TO SAVEPOINT {RECORD_SAVEPOINT}"))
                    .execute(tx.as_mut())
                    .await?;
                sqlx::query(&format!("RELEASE SAVEPOINT {RECORD_SAVEPOINT}"))
                    .execute(tx.as_mut())
                    .await?;
                Err(PersistError::from(error))
            }
        }
    }

    async fn commit(&mut self) -> Result<(), TargetError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), TargetError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(tx) = self.tx.take()
            && let Err(error) = tx.rollback().await
        {
            log::warn!("rollback of unfinished transaction on close failed: {error}");
        }
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Category;
    use serial_test::serial;

    /// Target over `DATABASE_URL` with a session-local `tyk_admin_keys`.
    async fn scratch_target() -> Option<PostgresTarget> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let options: PgConnectOptions = url.parse().expect("parse DATABASE_URL");
        let target = PostgresTarget::connect(options).await.expect("connect test database");
        // The pool holds one connection, so the temp table is visible to every write.
        sqlx::query(
            "CREATE TEMP TABLE tyk_admin_keys (
                key_id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                key_hash TEXT NOT NULL CHECK (key_hash <> 'reject me'),
                permissions JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&target.pool)
        .await
        .expect("create temp table");
        Some(target)
    }

    fn admin_key(id: &str, hash: &str) -> Vec<ColumnValue> {
        vec![
            ColumnValue::Text(id.to_string()),
            ColumnValue::Text("acme".to_string()),
            ColumnValue::Text(hash.to_string()),
            ColumnValue::Json("{}".to_string()),
        ]
    }

    #[tokio::test]
    #[serial]
    async fn rejected_write_releases_its_savepoint() {
        let Some(mut target) = scratch_target().await else {
            return;
        };
        let statement = UpsertStatement::for_category(Category::AdminKeys);

        let err = target
            .execute(&statement, &admin_key("k1", "reject me"))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("23514"));

        // Nothing is left to release once the rejected record is cleaned up.
        let tx = target.tx.as_mut().expect("open transaction");
        let release = sqlx::query(&format!("RELEASE SAVEPOINT {RECORD_SAVEPOINT}"))
            .execute(tx.as_mut())
            .await
            .unwrap_err();
        let code = release
            .as_database_error()
            .and_then(|db_error| db_error.code())
            .map(|code| code.into_owned());
        assert_eq!(code.as_deref(), Some("3B001"));

        target.rollback().await.unwrap();
        target.close().await;
    }

    #[tokio::test]
    #[serial]
    async fn writes_survive_repeated_rejections() {
        let Some(mut target) = scratch_target().await else {
            return;
        };
        let statement = UpsertStatement::for_category(Category::AdminKeys);

        target.execute(&statement, &admin_key("k1", "h1")).await.unwrap();
        for i in 0..5 {
            let id = format!("bad{i}");
            assert!(target.execute(&statement, &admin_key(&id, "reject me")).await.is_err());
        }
        target.execute(&statement, &admin_key("k2", "h2")).await.unwrap();
        target.commit().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tyk_admin_keys")
            .fetch_one(&target.pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
        target.close().await;
    }
}
