//! The job queue and the notification log are both persisted in SQLite so
//! that the gateway and any number of worker processes can share them through
//! a single database file. Every read-then-write sequence goes through a
//! `BEGIN IMMEDIATE` transaction, which takes the SQLite write lock up front
//! and makes claims and appends atomic across processes.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use std::borrow::Cow;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Upper bound of the pool size; workers and the gateway each open their own pool.
const MAX_POOL_SIZE: u32 = 10;

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// WAL pages written before SQLite checkpoints on its own.
const WAL_AUTOCHECKPOINT_PAGES: &str = "1000";

/// Pool size for a machine with `cores` cores.
fn pool_size_for(cores: u32) -> u32 {
    cores.saturating_mul(2).clamp(2, MAX_POOL_SIZE)
}

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true)
        .pragma("wal_autocheckpoint", Cow::Borrowed(WAL_AUTOCHECKPOINT_PAGES))
        .pragma("temp_store", Cow::Borrowed("MEMORY")))
}

/// Journal mode actually in effect. Another process may have opened the file
/// in rollback mode before us.
async fn check_journal_mode(pool: &DbPool) -> Result<(), sqlx::Error> {
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(pool)
        .await?;
    if !matches!(mode.as_str(), "wal" | "memory") {
        tracing::warn!(%mode, "Database is not in WAL mode, switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    }
    Ok(())
}

/// Open the job database at `database_url` (e.g. `sqlite:kyu.db?mode=rwc`).
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    let size = pool_size_for(cores);

    let pool = SqlitePoolOptions::new()
        .max_connections(size)
        .acquire_timeout(BUSY_TIMEOUT)
        .connect_with(connect_options(database_url)?)
        .await?;
    check_journal_mode(&pool).await?;

    tracing::info!(max_connections = size, "Database pool ready");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Connectivity check for the readiness endpoint.
pub async fn ping(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Start a transaction that holds the SQLite write lock from its first
/// statement.
///
/// Two processes racing for the same queued job serialize on `BEGIN` instead
/// of failing later on a lock upgrade.
pub async fn begin_immediate(pool: &DbPool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        open: true,
    })
}

pub struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl ImmediateTransaction {
    async fn end(mut self, statement: &'static str) -> Result<(), sqlx::Error> {
        sqlx::query(statement).execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.end("COMMIT").await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.end("ROLLBACK").await
    }
}

impl Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        &self.conn
    }
}

impl DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        // Never hand a connection inside an open transaction back to the pool.
        if self.open {
            self.conn.close_on_drop();
        }
    }
}
