//! Ambient transactional scope
//!
//! Data access code asks [`Database::client`] for a handle instead of taking
//! one as a parameter. Inside [`Database::with_transaction`] that handle is
//! bound to the open transaction; everywhere else it is the pool.
//!
//! The binding lives in a tokio task-local, so it follows the awaited call
//! graph of the current task. Work moved onto another task with
//! `tokio::spawn` does not see it.
//!
//! Nested `with_transaction` calls join the outer transaction. There are no
//! savepoints: an inner error that the caller swallows does not undo the
//! inner writes, and an outer error undoes everything.

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteQueryResult, SqliteRow};
use sqlx::Transaction;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::sqlite::{self, SqliteConfig};

type SharedTx = Arc<Mutex<Option<Transaction<'static, Sqlite>>>>;

tokio::task_local! {
    static AMBIENT_TX: SharedTx;
}

/// A query bound for SQLite
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Owner of the connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and migrate
    pub async fn connect(config: &SqliteConfig) -> Result<Self, StorageError> {
        Ok(Self::new(sqlite::connect(config).await?))
    }

    /// Single-connection in-memory database (testing)
    pub async fn memory() -> Result<Self, StorageError> {
        Self::connect(&SqliteConfig::memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The transaction handle when called inside `with_transaction`, the pool otherwise
    pub fn client(&self) -> DbClient {
        AMBIENT_TX
            .try_with(|tx| DbClient::Transaction(tx.clone()))
            .unwrap_or_else(|_| DbClient::Pool(self.pool.clone()))
    }

    /// Whether the caller is inside a transactional scope
    pub fn in_transaction() -> bool {
        AMBIENT_TX.try_with(|_| ()).is_ok()
    }

    /// Run `f` in a transaction: commit when it returns `Ok`, roll back on `Err`.
    ///
    /// The error from `f` is returned unchanged. Calls nested inside an open
    /// scope reuse its transaction and leave commit/rollback to the outermost
    /// call.
    pub async fn with_transaction<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(DbClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        if let Ok(outer) = AMBIENT_TX.try_with(|tx| tx.clone()) {
            debug!("Joining open transaction");
            return f(DbClient::Transaction(outer)).await;
        }

        let tx = self.pool.begin().await.map_err(StorageError::from)?;
        let shared: SharedTx = Arc::new(Mutex::new(Some(tx)));

        let client = DbClient::Transaction(shared.clone());
        let result = AMBIENT_TX
            .scope(shared.clone(), async move { f(client).await })
            .await;

        let Some(tx) = shared.lock().await.take() else {
            return Err(StorageError::Internal("transaction vanished before commit".into()).into());
        };

        match result {
            Ok(value) => {
                tx.commit().await.map_err(StorageError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// A handle for running queries: the pool or the open transaction
#[derive(Clone)]
pub enum DbClient {
    Pool(SqlitePool),
    Transaction(SharedTx),
}

impl fmt::Debug for DbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pool(_) => f.write_str("DbClient::Pool"),
            Self::Transaction(_) => f.write_str("DbClient::Transaction"),
        }
    }
}

fn closed_transaction() -> StorageError {
    StorageError::Internal("transaction already finished".into())
}

impl DbClient {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    pub async fn execute(&self, query: SqliteQuery<'_>) -> Result<SqliteQueryResult, StorageError> {
        match self {
            Self::Pool(pool) => Ok(query.execute(pool).await?),
            Self::Transaction(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(closed_transaction)?;
                Ok(query.execute(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_all(&self, query: SqliteQuery<'_>) -> Result<Vec<SqliteRow>, StorageError> {
        match self {
            Self::Pool(pool) => Ok(query.fetch_all(pool).await?),
            Self::Transaction(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(closed_transaction)?;
                Ok(query.fetch_all(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_optional(
        &self,
        query: SqliteQuery<'_>,
    ) -> Result<Option<SqliteRow>, StorageError> {
        match self {
            Self::Pool(pool) => Ok(query.fetch_optional(pool).await?),
            Self::Transaction(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(closed_transaction)?;
                Ok(query.fetch_optional(&mut **tx).await?)
            }
        }
    }

    pub async fn fetch_one(&self, query: SqliteQuery<'_>) -> Result<SqliteRow, StorageError> {
        match self {
            Self::Pool(pool) => Ok(query.fetch_one(pool).await?),
            Self::Transaction(shared) => {
                let mut guard = shared.lock().await;
                let tx = guard.as_mut().ok_or_else(closed_transaction)?;
                Ok(query.fetch_one(&mut **tx).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn count_users(db: &Database) -> i64 {
        db.client()
            .fetch_one(sqlx::query("SELECT COUNT(*) AS n FROM users"))
            .await
            .unwrap()
            .get("n")
    }

    async fn insert_user(db: &Database, id: &str) -> Result<(), StorageError> {
        db.client()
            .execute(
                sqlx::query("INSERT INTO users (id, username, created_at) VALUES (?, ?, 0)")
                    .bind(id)
                    .bind(id),
            )
            .await
            .map(|_| ())
    }

    #[tokio::test]
    async fn test_client_outside_scope_is_pool() {
        let db = Database::memory().await.unwrap();
        assert!(!db.client().is_transaction());
        assert!(!Database::in_transaction());
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let db = Database::memory().await.unwrap();

        let value = db
            .with_transaction(|tx| {
                let db = db.clone();
                async move {
                    assert!(tx.is_transaction());
                    // The ambient client is the same transaction
                    assert!(db.client().is_transaction());
                    insert_user(&db, "a").await?;
                    insert_user(&db, "b").await?;
                    Ok::<_, StorageError>(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(count_users(&db).await, 2);
    }

    #[tokio::test]
    async fn test_error_rolls_back_and_is_returned() {
        let db = Database::memory().await.unwrap();

        let result: Result<(), StorageError> = db
            .with_transaction(|_| {
                let db = db.clone();
                async move {
                    insert_user(&db, "a").await?;
                    Err(StorageError::Invalid("boom".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(StorageError::Invalid(m)) if m == "boom"));
        assert_eq!(count_users(&db).await, 0);
    }

    #[tokio::test]
    async fn test_nested_scope_joins_outer_transaction() {
        let db = Database::memory().await.unwrap();

        let result: Result<(), StorageError> = db
            .with_transaction(|_| {
                let db = db.clone();
                async move {
                    insert_user(&db, "outer").await?;
                    let inner_db = db.clone();
                    db.with_transaction(|_| async move { insert_user(&inner_db, "inner").await })
                        .await?;
                    Err(StorageError::Invalid("outer fails after inner".into()))
                }
            })
            .await;

        assert!(result.is_err());
        // The inner write belonged to the outer transaction and was rolled back with it
        assert_eq!(count_users(&db).await, 0);
    }

    #[tokio::test]
    async fn test_scope_ends_with_transaction() {
        let db = Database::memory().await.unwrap();
        db.with_transaction(|_| async { Ok::<_, StorageError>(()) })
            .await
            .unwrap();
        assert!(!db.client().is_transaction());
    }
}
