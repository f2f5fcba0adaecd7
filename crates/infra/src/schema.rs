//! SQLite tables backing the authorization graph.
//!
//! Identifiers are application-generated text keys. Timestamps are RFC 3339
//! text; user data and provider data are JSON text.

use sqlx::SqlitePool;
use tracing::{debug, instrument};

use crate::error::{StoreResult, map_sqlx_error};

pub const STATEMENTS: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        usr TEXT PRIMARY KEY NOT NULL,
        data TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS "groups" (
        grp TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        created TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS permissions (
        perm TEXT PRIMARY KEY NOT NULL,
        created TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_permissions (
        grp TEXT NOT NULL REFERENCES "groups" (grp),
        perm TEXT NOT NULL REFERENCES permissions (perm),
        created TEXT NOT NULL,
        PRIMARY KEY (grp, perm)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_groups (
        usr TEXT NOT NULL REFERENCES users (usr),
        grp TEXT NOT NULL REFERENCES "groups" (grp),
        main INTEGER NOT NULL DEFAULT 0,
        created TEXT NOT NULL,
        PRIMARY KEY (usr, grp)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_providers (
        usrprov TEXT PRIMARY KEY NOT NULL,
        provider TEXT NOT NULL,
        id TEXT NOT NULL,
        usr TEXT NOT NULL REFERENCES users (usr),
        name TEXT,
        data TEXT,
        created TEXT NOT NULL,
        used TEXT,
        disabled INTEGER NOT NULL DEFAULT 0,
        UNIQUE (provider, id)
    )
    "#,
];

/// Create any missing tables. Safe to run on every start.
#[instrument(skip(pool), err)]
pub async fn apply(pool: &SqlitePool) -> StoreResult<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
    }
    debug!(tables = STATEMENTS.len(), "schema applied");
    Ok(())
}
