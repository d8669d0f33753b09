//! `SQLite` plumbing for Outpost record stores.
//!
//! Stores are declared with `define_database!`; this module supplies the
//! pools behind them and the error type their queries return.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

const FILE_POOL_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A stored value no longer parses (e.g. a JSON column).
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row".into()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Open (or create) the database file, creating its directory.
///
/// File databases run in WAL mode with a busy timeout so the tunnel server
/// and management calls can write concurrently.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = parse_options(&format!("sqlite:{}?mode=rwc", path.display()))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = connect(options, FILE_POOL_CONNECTIONS).await?;

    info!(path = %path.display(), "Database opened");
    Ok(pool)
}

/// Open a private in-memory database.
///
/// Every connection would get its own empty database, so the pool holds one.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    connect(parse_options("sqlite::memory:")?, 1).await
}

fn parse_options(url: &str) -> Result<SqliteConnectOptions, DatabaseError> {
    SqliteConnectOptions::from_str(url)
        .map(|options| options.foreign_keys(true))
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

async fn connect(
    options: SqliteConnectOptions,
    max_connections: u32,
) -> Result<Pool<Sqlite>, DatabaseError> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Seconds since the Unix epoch, as stored in `*_at` columns.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Apply `migrator` to `pool`, logging how many migrations the store has.
pub async fn migrate(
    pool: &Pool<Sqlite>,
    migrator: &Migrator,
    store: &'static str,
) -> Result<(), DatabaseError> {
    migrator
        .run(pool)
        .await
        .map_err(|e| DatabaseError::Migration(format!("{store}: {e}")))?;
    info!(store, migrations = migrator.iter().count(), "Schema up to date");
    Ok(())
}

/// Declare a record store backed by a `SQLite` pool.
///
/// The migrator is embedded from `./migrations` of the crate that invokes
/// the macro, so each store ships its own schema. The generated type gets
/// `open`, `open_in_memory` and `pool`.
///
/// ```ignore
/// outpost_core::define_database!(RelayDatabase, "relay");
/// ```
#[macro_export]
macro_rules! define_database {
    ($name:ident, $store:literal) => {
        static MIGRATOR: ::sqlx::migrate::Migrator = ::sqlx::migrate!("./migrations");

        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            /// Open or create the store at `path` and bring its schema up to date.
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::migrated($crate::db::open_pool(path).await?).await
            }

            /// Empty store that lives as long as the handle (tests).
            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::migrated($crate::db::open_pool_in_memory().await?).await
            }

            async fn migrated(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                $crate::db::migrate(&pool, &MIGRATOR, $store).await?;
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}
