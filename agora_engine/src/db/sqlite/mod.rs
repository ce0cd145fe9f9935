//! # SQLite order store
//!
//! Row-level database interactions are simple functions (rather than stateful structs) that accept a
//! `&mut SqliteConnection`. Callers obtain a [`StoreTx`] from [`SqliteDatabase`] and pass `tx.conn()` through.
//!
//! Update transactions are serialised by a writer lock held for the lifetime of the transaction, which gives every
//! order a total order of transitions matching commit order. View transactions take no lock and read a consistent
//! snapshot (the database runs in WAL mode).
pub mod messages;
pub mod orders;
pub mod outgoing;
pub mod parked;
mod store_tx;
pub mod transactions;

use std::{env, fmt::Debug, panic::AssertUnwindSafe, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use futures_util::{future::BoxFuture, FutureExt};
use log::*;
use sqlx::{
    migrate,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
pub use store_tx::{Savepoint, StoreTx};
use tokio::sync::Mutex;

use crate::db::{PublicData, StoreError};

const SQLITE_DB_URL: &str = "sqlite://data/agora_store.db";
const PUBLIC_DATA_DIR: &str = "data/public";

pub fn db_url() -> String {
    let result = env::var("AGORA_DATABASE_URL").unwrap_or_else(|_| {
        info!("🗃️ AGORA_DATABASE_URL is not set. Using the default.");
        SQLITE_DB_URL.to_string()
    });
    info!("🗃️ Using database URL: {result}");
    result
}

pub async fn new_pool(url: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30));
    let pool = SqlitePoolOptions::new().max_connections(max_connections).connect_with(options).await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct SqliteDatabase {
    url: String,
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    public: PublicData,
}

impl Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "SqliteDatabase ({:?})", self.pool)
    }
}

impl SqliteDatabase {
    /// Connects using `AGORA_DATABASE_URL` and a public data directory under `data/`.
    pub async fn new(max_connections: u32) -> Result<Self, StoreError> {
        let url = db_url();
        SqliteDatabase::new_with_url(url.as_str(), max_connections, PUBLIC_DATA_DIR).await
    }

    pub async fn new_with_url<P: Into<PathBuf>>(
        url: &str,
        max_connections: u32,
        public_dir: P,
    ) -> Result<Self, StoreError> {
        trace!("🗃️ Creating new database connection pool with url {url}");
        let pool = new_pool(url, max_connections).await?;
        let url = url.to_string();
        let public = PublicData::new(public_dir);
        Ok(Self { url, pool, writer: Arc::new(Mutex::new(())), public })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Returns a reference to the database connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn public_data(&self) -> &PublicData {
        &self.public
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        migrate!("./src/db/sqlite/migrations").run(&self.pool).await?;
        info!("🗃️ Migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn begin_view(&self) -> Result<StoreTx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(StoreTx::new(tx, None, self.public.clone()))
    }

    /// Opens an update transaction, waiting for any other update transaction to finish first.
    pub async fn begin_update(&self) -> Result<StoreTx, StoreError> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(StoreTx::new(tx, Some(guard), self.public.clone()))
    }

    /// Runs `f` in a read-only transaction.
    pub async fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut StoreTx) -> BoxFuture<'a, Result<T, E>>,
        E: From<StoreError>,
    {
        let tx = self.begin_view().await?;
        run_managed(tx, f).await
    }

    /// Runs `f` in an update transaction. `Ok` commits, `Err` rolls back, and a panic inside `f` rolls back and is
    /// reported as [`StoreError::Panicked`].
    pub async fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut StoreTx) -> BoxFuture<'a, Result<T, E>>,
        E: From<StoreError>,
    {
        let tx = self.begin_update().await?;
        run_managed(tx, f).await
    }
}

async fn run_managed<T, E, F>(mut tx: StoreTx, f: F) -> Result<T, E>
where
    F: for<'a> FnOnce(&'a mut StoreTx) -> BoxFuture<'a, Result<T, E>>,
    E: From<StoreError>,
{
    let outcome = AssertUnwindSafe(f(&mut tx)).catch_unwind().await;
    match outcome {
        Ok(Ok(value)) => {
            tx.commit().await?;
            Ok(value)
        },
        Ok(Err(e)) => {
            if let Err(rb) = tx.rollback().await {
                warn!("🗃️ Rollback failed: {rb}");
            }
            Err(e)
        },
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("🗃️ Transaction function panicked: {reason}. Rolling back.");
            if let Err(rb) = tx.rollback().await {
                warn!("🗃️ Rollback failed: {rb}");
            }
            Err(StoreError::Panicked(reason).into())
        },
    }
}
