use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous};
use tracing::instrument;

use crate::error::{StoreResult, map_sqlx_error};

/// Open a SQLite pool with WAL journaling and foreign keys enforced.
///
/// `database_url` is a sqlx SQLite URL such as `sqlite://warden.db` or
/// `sqlite::memory:`. The database file is created when missing.
#[instrument(skip(database_url), err)]
pub async fn create_pool(database_url: &str) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| map_sqlx_error("parse_database_url", e))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;
    tracing::debug!("sqlite pool created");
    Ok(pool)
}
