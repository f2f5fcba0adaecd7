//! SQLite-backed reconciliation of the authorization graph.
//!
//! [`Reconciler`] owns a [`Registry`] and keeps it in step with the store:
//! reads fall back to the database when the registry misses (and cache what
//! they load), writes run in one transaction each and only touch the
//! registry after commit.
//!
//! ## Transactions
//!
//! Every multi-row write begins a transaction, runs each step on it, and on
//! any failure rolls back and returns the original error. Hydration happens
//! before `begin` so a single-connection pool never deadlocks.
//!
//! ## Cache
//!
//! The permission catalog (`{namespace}_perms`) and the group grants
//! (`{namespace}_groups`) are cached at bootstrap and invalidated whenever
//! the corresponding rows change. Cache failures are logged and read as
//! misses.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info, instrument, warn};

use warden_auth::{Group, IdentityClaims, ProviderLink, Registry, User};
use warden_core::{AuthError, GroupId, UserId};

use crate::cache::Cache;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult, map_sqlx_error};

/// Keys of the data bag that never reach the `users.data` column.
const INTERNAL_FIELDS: [&str; 2] = ["id", "usr"];

pub struct Reconciler {
    registry: Registry,
    pool: SqlitePool,
    cache: Option<Arc<dyn Cache>>,
    config: StoreConfig,
}

impl core::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .field("cached", &self.cache.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Load the permission catalog and group grants (from cache when
    /// possible) and build the registry.
    #[instrument(skip(pool, cache, config), fields(namespace = %config.cache_namespace), err)]
    pub async fn connect(
        pool: SqlitePool,
        cache: Option<Arc<dyn Cache>>,
        config: StoreConfig,
    ) -> StoreResult<Self> {
        let mut reconciler = Self {
            registry: Registry::default(),
            pool,
            cache,
            config,
        };
        let permissions = reconciler.load_catalog().await?;
        let groups = reconciler.load_groups().await?;
        debug!(
            permissions = permissions.len(),
            groups = groups.len(),
            "registry bootstrapped"
        );
        reconciler.registry = Registry::new(groups, permissions);
        Ok(reconciler)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cache
    // ─────────────────────────────────────────────────────────────────────

    fn cache_get(&self, key: &str) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        match cache.get(key) {
            Ok(hit) => hit,
            Err(err) => {
                warn!(key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    fn cache_set(&self, key: &str, value: &Value) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.set(key, value, self.config.cache_ttl()) {
                warn!(key, error = %err, "cache write failed");
            }
        }
    }

    fn invalidate(&self, keys: &[String]) {
        let Some(cache) = &self.cache else {
            return;
        };
        for key in keys {
            if let Err(err) = cache.delete(key) {
                warn!(key = %key, error = %err, "cache invalidation failed");
            }
        }
    }

    fn invalidate_groups(&self) {
        self.invalidate(&[self.config.groups_key()]);
    }

    fn invalidate_all(&self) {
        self.invalidate(&[self.config.groups_key(), self.config.permissions_key()]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bootstrap
    // ─────────────────────────────────────────────────────────────────────

    async fn load_catalog(&self) -> StoreResult<Vec<String>> {
        let key = self.config.permissions_key();
        if let Some(cached) = self.cache_get(&key) {
            match serde_json::from_value::<Vec<String>>(cached) {
                Ok(perms) => {
                    debug!(key = %key, "permission catalog from cache");
                    return Ok(perms);
                }
                Err(err) => warn!(key = %key, error = %err, "cached catalog unreadable; reloading"),
            }
        }

        let rows = sqlx::query("SELECT perm FROM permissions ORDER BY perm")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_catalog", e))?;
        let perms = rows
            .iter()
            .map(|row| row.try_get::<String, _>("perm"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("load_catalog", e))?;
        self.cache_set(&key, &json!(perms));
        Ok(perms)
    }

    async fn load_groups(&self) -> StoreResult<Vec<Group>> {
        let key = self.config.groups_key();
        let grants = match self.cache_get(&key).map(serde_json::from_value::<Vec<GrantRow>>) {
            Some(Ok(grants)) => {
                debug!(key = %key, "group grants from cache");
                grants
            }
            cached => {
                if let Some(Err(err)) = cached {
                    warn!(key = %key, error = %err, "cached grants unreadable; reloading");
                }
                let grants = self.fetch_grants().await?;
                match serde_json::to_value(&grants) {
                    Ok(value) => self.cache_set(&key, &value),
                    Err(err) => warn!(error = %err, "grants not serializable; cache skipped"),
                }
                grants
            }
        };

        let mut groups: Vec<Group> = Vec::new();
        for grant in grants {
            let id = GroupId::new(grant.grp);
            if groups.last().is_none_or(|last| last.id() != &id) {
                groups.push(Group::new(id, grant.name));
            }
            if let (Some(perm), Some(group)) = (grant.perm, groups.last_mut()) {
                group.add_permission(perm);
            }
        }
        Ok(groups)
    }

    async fn fetch_grants(&self) -> StoreResult<Vec<GrantRow>> {
        let rows = sqlx::query(
            r#"
            SELECT g.grp AS grp, g.name AS name, gp.perm AS perm
            FROM "groups" g
            LEFT JOIN group_permissions gp ON gp.grp = g.grp
            ORDER BY g.grp, gp.perm
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_groups", e))?;

        rows.iter()
            .map(|row| {
                Ok(GrantRow {
                    grp: row.try_get("grp")?,
                    name: row.try_get("name")?,
                    perm: row.try_get("perm")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("load_groups", e))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Hydrating reads
    // ─────────────────────────────────────────────────────────────────────

    /// Registry lookup, falling back to the store.
    #[instrument(skip(self), fields(group = %id), err(level = "debug"))]
    pub async fn get_group(&mut self, id: &GroupId) -> StoreResult<Group> {
        if let Ok(group) = self.registry.get_group(id) {
            return Ok(group.clone());
        }

        let row = sqlx::query(r#"SELECT name FROM "groups" WHERE grp = ?"#)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_group", e))?
            .ok_or_else(|| AuthError::not_found(format!("group {id}")))?;
        let name: String = row.try_get("name").map_err(|e| map_sqlx_error("load_group", e))?;

        let perms = sqlx::query("SELECT perm FROM group_permissions WHERE grp = ? ORDER BY perm")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_group", e))?;
        let mut group = Group::new(id.clone(), name);
        for row in perms {
            let perm: String = row.try_get("perm").map_err(|e| map_sqlx_error("load_group", e))?;
            group.add_permission(perm);
        }

        debug!("group hydrated from store");
        self.registry.save_group(group.clone());
        Ok(group)
    }

    /// Registry lookup, falling back to the store.
    #[instrument(skip(self), fields(user = %id), err(level = "debug"))]
    pub async fn get_user(&mut self, id: &UserId) -> StoreResult<User> {
        if let Ok(user) = self.registry.get_user(id) {
            return Ok(user.clone());
        }

        let row = sqlx::query("SELECT data FROM users WHERE usr = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_user", e))?
            .ok_or_else(|| AuthError::not_found(format!("user {id}")))?;
        let data: String = row.try_get("data").map_err(|e| map_sqlx_error("load_user", e))?;
        let data: Map<String, Value> = serde_json::from_str(&data).map_err(|e| decode_error("load_user", e))?;

        let memberships = sqlx::query("SELECT grp, main FROM user_groups WHERE usr = ? ORDER BY grp")
            .bind(id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_user_groups", e))?;
        let links = sqlx::query(
            r#"
            SELECT provider, id, name, data, created, used, disabled
            FROM user_providers
            WHERE usr = ?
            ORDER BY created, provider, id
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_user_providers", e))?;

        let mut user = User::with_id(id.clone());
        *user.data_mut() = data.into();

        let mut primary = None;
        for row in &memberships {
            let grp = GroupId::new(
                row.try_get::<String, _>("grp")
                    .map_err(|e| map_sqlx_error("load_user_groups", e))?,
            );
            let main: bool = row.try_get("main").map_err(|e| map_sqlx_error("load_user_groups", e))?;
            self.get_group(&grp).await?;
            if main {
                primary = Some(grp.clone());
            }
            user.add_group(grp);
        }
        user.set_primary_group(primary)?;

        for row in &links {
            user.add_provider(provider_from_row(row)?)?;
        }

        debug!(groups = memberships.len(), providers = links.len(), "user hydrated from store");
        self.registry.save_user(&mut user)?;
        Ok(user)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a user and everything it references, then cache it.
    ///
    /// The user's id is written back: a fresh one for new rows, the matched
    /// row's id when found by unique fields, and a fresh one when the given
    /// id no longer exists.
    #[instrument(skip(self, user), fields(user = ?user.id()), err)]
    pub async fn save_user(&mut self, user: &mut User) -> StoreResult<UserId> {
        for group in user.groups() {
            match self.get_group(group).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    return Err(AuthError::invalid_state(format!("unknown group {group}")).into());
                }
                Err(err) => return Err(err),
            }
        }
        self.registry.validate_user(user)?;

        let data = serde_json::to_string(&user.data().without(&INTERNAL_FIELDS))
            .map_err(|e| decode_error("encode_user", e))?;

        let mut tx = self.begin("save_user").await?;
        let id = match write_user(&mut tx, user, &data, &self.config.unique_fields).await {
            Ok(id) => id,
            Err(err) => {
                rollback(tx, "save_user").await;
                return Err(err);
            }
        };
        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;

        if let Some(previous) = user.id().filter(|previous| *previous != &id).cloned() {
            self.registry.forget_user(&previous);
        }
        user.set_id(id.clone());
        self.registry.save_user(user)?;
        info!(user = %id, "user saved");
        Ok(id)
    }

    /// Delete a user row with its memberships and provider links.
    #[instrument(skip(self), fields(user = %id), err)]
    pub async fn delete_user(&mut self, id: &UserId) -> StoreResult<()> {
        let mut tx = self.begin("delete_user").await?;
        let result = async {
            for statement in [
                "DELETE FROM user_providers WHERE usr = ?",
                "DELETE FROM user_groups WHERE usr = ?",
            ] {
                sqlx::query(statement)
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("delete_user", e))?;
            }
            let deleted = sqlx::query("DELETE FROM users WHERE usr = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_user", e))?;
            if deleted.rows_affected() == 0 {
                return Err(AuthError::not_found(format!("user {id}")).into());
            }
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish(tx, "delete_user", result).await?;

        self.registry.forget_user(id);
        info!("user deleted");
        Ok(())
    }

    /// Find the user owning an enabled provider link and stamp the link as used.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn get_user_by_provider_id(&mut self, provider: &str, external_id: &str) -> StoreResult<User> {
        let row = sqlx::query("SELECT usr FROM user_providers WHERE provider = ? AND id = ? AND disabled = 0")
            .bind(provider)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_provider", e))?
            .ok_or_else(|| AuthError::not_found(format!("provider link {provider}:{external_id}")))?;
        let owner = UserId::new(
            row.try_get::<String, _>("usr")
                .map_err(|e| map_sqlx_error("find_provider", e))?,
        );

        sqlx::query("UPDATE user_providers SET used = ? WHERE provider = ? AND id = ?")
            .bind(Utc::now())
            .bind(provider)
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stamp_provider", e))?;

        let hydrated = self.get_user(&owner).await?;
        match self.registry.get_user_by_provider_id(provider, external_id) {
            Ok(user) if user.id() == Some(&owner) => Ok(user.clone()),
            _ => Ok(hydrated),
        }
    }

    /// Users whose data bag equals every `field -> value` pair in `query`.
    ///
    /// Fields may be dotted paths. Objects and arrays cannot be matched.
    #[instrument(skip(self, query), fields(filters = query.len()), err)]
    pub async fn search_users(&mut self, query: &Map<String, Value>) -> StoreResult<Vec<User>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT usr FROM users");
        for (i, (field, value)) in query.iter().enumerate() {
            qb.push(if i == 0 { " WHERE " } else { " AND " });
            qb.push("json_extract(data, ");
            qb.push_bind(json_path(field)?);
            qb.push(")");
            match value {
                Value::Null => {
                    qb.push(" IS NULL");
                }
                Value::Bool(b) => {
                    qb.push(" = ");
                    qb.push_bind(*b);
                }
                Value::Number(n) => {
                    qb.push(" = ");
                    match n.as_i64() {
                        Some(i) => qb.push_bind(i),
                        None => qb.push_bind(n.as_f64().unwrap_or_default()),
                    };
                }
                Value::String(s) => {
                    qb.push(" = ");
                    qb.push_bind(s.clone());
                }
                Value::Array(_) | Value::Object(_) => {
                    return Err(AuthError::invalid_filter(format!("'{field}' must be matched against a scalar")).into());
                }
            }
        }
        qb.push(" ORDER BY usr");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuthError::invalid_filter(e.to_string()))?;
        let mut users = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("usr").map_err(|e| AuthError::invalid_filter(e.to_string()))?;
            users.push(self.get_user(&UserId::new(id)).await?);
        }
        Ok(users)
    }

    /// Resolve the user behind verified identity claims, registering a new
    /// one when `register` is set.
    #[instrument(skip(self, identity), fields(provider = ?identity.provider), err)]
    pub async fn user_for_identity(&mut self, identity: &IdentityClaims, register: bool) -> StoreResult<User> {
        let (provider, external_id) = identity.provider_key()?;
        match self.get_user_by_provider_id(provider, external_id).await {
            Ok(user) => Ok(user),
            Err(err) if err.is_not_found() && register => {
                let mut user = identity.registration()?;
                self.save_user(&mut user).await?;
                info!(provider, "user registered from identity");
                Ok(user)
            }
            Err(err) => Err(err),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups & permissions
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or rename a group and reconcile its grants. Permissions it
    /// names that are not catalogued yet are added to the catalog.
    #[instrument(skip(self, group), fields(group = %group.id()), err)]
    pub async fn save_group(&mut self, group: &Group) -> StoreResult<()> {
        let mut tx = self.begin("save_group").await?;
        let result = write_group(&mut tx, group).await;
        self.finish(tx, "save_group", result).await?;

        self.registry.save_group(group.clone());
        self.invalidate_all();
        info!(permissions = group.permissions().len(), "group saved");
        Ok(())
    }

    /// Delete a group with its grants and memberships.
    #[instrument(skip(self), fields(group = %id), err)]
    pub async fn delete_group(&mut self, id: &GroupId) -> StoreResult<()> {
        let mut tx = self.begin("delete_group").await?;
        let result = async {
            for statement in [
                "DELETE FROM user_groups WHERE grp = ?",
                "DELETE FROM group_permissions WHERE grp = ?",
            ] {
                sqlx::query(statement)
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("delete_group", e))?;
            }
            let deleted = sqlx::query(r#"DELETE FROM "groups" WHERE grp = ?"#)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_group", e))?;
            if deleted.rows_affected() == 0 {
                return Err(AuthError::not_found(format!("group {id}")).into());
            }
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish(tx, "delete_group", result).await?;

        if let Err(err) = self.registry.delete_group(id) {
            debug!(error = %err, "group was not cached");
        }
        self.invalidate_groups();
        info!("group deleted");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn add_permission(&mut self, name: &str) -> StoreResult<()> {
        if self.registry.permission_exists(name) {
            return Err(AuthError::already_exists(format!("permission '{name}'")).into());
        }
        let inserted = sqlx::query("INSERT INTO permissions (perm, created) VALUES (?, ?) ON CONFLICT (perm) DO NOTHING")
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_permission", e))?;
        if inserted.rows_affected() == 0 {
            // Catalogued by another process since bootstrap; adopt it.
            self.registry.add_permission(name.to_string())?;
            self.invalidate_all();
            return Err(AuthError::already_exists(format!("permission '{name}'")).into());
        }

        self.registry.add_permission(name.to_string())?;
        self.invalidate_all();
        info!("permission added");
        Ok(())
    }

    /// Remove a permission from the catalog and from every group.
    #[instrument(skip(self), err)]
    pub async fn delete_permission(&mut self, name: &str) -> StoreResult<()> {
        let mut tx = self.begin("delete_permission").await?;
        let result = async {
            sqlx::query("DELETE FROM group_permissions WHERE perm = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_permission", e))?;
            let deleted = sqlx::query("DELETE FROM permissions WHERE perm = ?")
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_permission", e))?;
            if deleted.rows_affected() == 0 {
                return Err(AuthError::not_found(format!("permission '{name}'")).into());
            }
            Ok::<(), StoreError>(())
        }
        .await;
        self.finish(tx, "delete_permission", result).await?;

        if let Err(err) = self.registry.delete_permission(name) {
            debug!(error = %err, "permission was not cached");
        }
        self.invalidate_all();
        info!("permission deleted");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transactions
    // ─────────────────────────────────────────────────────────────────────

    async fn begin(&self, operation: &'static str) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool.begin().await.map_err(|e| map_sqlx_error(operation, e))
    }

    /// Commit on success; roll back and surface the original error otherwise.
    async fn finish(
        &self,
        tx: Transaction<'static, Sqlite>,
        operation: &'static str,
        result: StoreResult<()>,
    ) -> StoreResult<()> {
        match result {
            Ok(()) => tx.commit().await.map_err(|e| map_sqlx_error("commit", e)),
            Err(err) => {
                rollback(tx, operation).await;
                Err(err)
            }
        }
    }
}

async fn rollback(tx: Transaction<'static, Sqlite>, operation: &'static str) {
    if let Err(err) = tx.rollback().await {
        warn!(operation, error = %err, "rollback failed");
    } else {
        warn!(operation, "transaction rolled back");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transaction steps
// ─────────────────────────────────────────────────────────────────────────────

async fn write_user(
    conn: &mut SqliteConnection,
    user: &User,
    data: &str,
    unique_fields: &[String],
) -> StoreResult<UserId> {
    let existing = match user.id() {
        Some(id) => {
            let found = sqlx::query("SELECT 1 FROM users WHERE usr = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("find_user", e))?;
            if found.is_none() {
                debug!(stale = %id, "user id not in store; inserting under a fresh id");
            }
            found.map(|_| id.clone())
        }
        None => find_by_unique_fields(conn, user, unique_fields).await?,
    };

    let id = match existing {
        Some(id) => {
            sqlx::query("UPDATE users SET data = ? WHERE usr = ?")
                .bind(data)
                .bind(id.as_str())
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("update_user", e))?;
            id
        }
        None => {
            let id = UserId::generate();
            sqlx::query("INSERT INTO users (usr, data) VALUES (?, ?)")
                .bind(id.as_str())
                .bind(data)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("insert_user", e))?;
            id
        }
    };

    write_memberships(conn, &id, user).await?;
    write_providers(conn, &id, user).await?;
    Ok(id)
}

async fn find_by_unique_fields(
    conn: &mut SqliteConnection,
    user: &User,
    unique_fields: &[String],
) -> StoreResult<Option<UserId>> {
    if unique_fields.is_empty() {
        return Ok(None);
    }
    let mut values = Vec::with_capacity(unique_fields.len());
    for field in unique_fields {
        match user.get(field) {
            Some(Value::String(s)) => values.push(s.clone()),
            Some(Value::Number(n)) => values.push(n.to_string()),
            Some(Value::Bool(b)) => values.push(if *b { "1" } else { "0" }.to_string()),
            _ => return Ok(None),
        }
    }

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT usr FROM users WHERE ");
    let mut clauses = qb.separated(" AND ");
    for (field, value) in unique_fields.iter().zip(values) {
        clauses.push("CAST(json_extract(data, ");
        clauses.push_bind_unseparated(json_path(field)?);
        clauses.push_unseparated(") AS TEXT) = ");
        clauses.push_bind_unseparated(value);
    }
    qb.push(" ORDER BY usr LIMIT 1");

    let row = qb
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("find_user_by_unique_fields", e))?;
    row.map(|r| r.try_get::<String, _>("usr").map(UserId::new))
        .transpose()
        .map_err(|e| map_sqlx_error("find_user_by_unique_fields", e))
}

async fn write_memberships(conn: &mut SqliteConnection, id: &UserId, user: &User) -> StoreResult<()> {
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM user_groups WHERE usr = ");
    qb.push_bind(id.to_string());
    push_not_in(&mut qb, "grp", user.groups().iter().map(GroupId::to_string));
    qb.build()
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("prune_memberships", e))?;

    let now = Utc::now();
    for group in user.groups() {
        sqlx::query(
            "INSERT INTO user_groups (usr, grp, main, created) VALUES (?, ?, 0, ?) ON CONFLICT (usr, grp) DO NOTHING",
        )
        .bind(id.as_str())
        .bind(group.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_membership", e))?;
    }

    sqlx::query("UPDATE user_groups SET main = 0 WHERE usr = ?")
        .bind(id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("clear_primary_group", e))?;
    if let Some(primary) = user.primary_group() {
        sqlx::query("UPDATE user_groups SET main = 1 WHERE usr = ? AND grp = ?")
            .bind(id.as_str())
            .bind(primary.as_str())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("set_primary_group", e))?;
    }
    Ok(())
}

async fn write_providers(conn: &mut SqliteConnection, id: &UserId, user: &User) -> StoreResult<()> {
    let current: HashSet<(String, String)> = user.providers().iter().map(ProviderLink::key).collect();
    let stored = sqlx::query("SELECT provider, id FROM user_providers WHERE usr = ?")
        .bind(id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_user_providers", e))?;
    for row in stored {
        let pair: (String, String) = (
            row.try_get("provider").map_err(|e| map_sqlx_error("load_user_providers", e))?,
            row.try_get("id").map_err(|e| map_sqlx_error("load_user_providers", e))?,
        );
        if !current.contains(&pair) {
            sqlx::query("DELETE FROM user_providers WHERE usr = ? AND provider = ? AND id = ?")
                .bind(id.as_str())
                .bind(&pair.0)
                .bind(&pair.1)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("delete_provider", e))?;
        }
    }

    for link in user.providers() {
        let data = link
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| decode_error("encode_provider", e))?;
        let owner: Option<String> = sqlx::query("SELECT usr FROM user_providers WHERE provider = ? AND id = ?")
            .bind(&link.provider)
            .bind(&link.external_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("find_provider", e))?
            .map(|row| row.try_get("usr"))
            .transpose()
            .map_err(|e| map_sqlx_error("find_provider", e))?;

        match owner {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO user_providers (usrprov, provider, id, usr, name, data, created, used, disabled)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(UserId::generate().to_string())
                .bind(&link.provider)
                .bind(&link.external_id)
                .bind(id.as_str())
                .bind(link.display_name.as_deref())
                .bind(data)
                .bind(link.created_at)
                .bind(link.last_used_at)
                .bind(link.disabled)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("insert_provider", e))?;
            }
            Some(owner) if owner == id.as_str() => {
                sqlx::query(
                    r#"
                    UPDATE user_providers
                    SET name = ?, data = ?, used = COALESCE(?, used), disabled = ?
                    WHERE provider = ? AND id = ?
                    "#,
                )
                .bind(link.display_name.as_deref())
                .bind(data)
                .bind(link.last_used_at)
                .bind(link.disabled)
                .bind(&link.provider)
                .bind(&link.external_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("update_provider", e))?;
            }
            Some(owner) => {
                debug!(
                    provider = %link.provider,
                    external_id = %link.external_id,
                    owner = %owner,
                    "provider pair belongs to another user; skipped"
                );
            }
        }
    }
    Ok(())
}

async fn write_group(conn: &mut SqliteConnection, group: &Group) -> StoreResult<()> {
    let now = Utc::now();
    let renamed = sqlx::query(r#"UPDATE "groups" SET name = ? WHERE grp = ?"#)
        .bind(group.name())
        .bind(group.id().as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("rename_group", e))?;
    if renamed.rows_affected() == 0 {
        sqlx::query(r#"INSERT INTO "groups" (grp, name, created) VALUES (?, ?, ?)"#)
            .bind(group.id().as_str())
            .bind(group.name())
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("insert_group", e))?;
    }

    for perm in group.permissions() {
        sqlx::query("INSERT INTO permissions (perm, created) VALUES (?, ?) ON CONFLICT (perm) DO NOTHING")
            .bind(perm.as_str())
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("catalogue_permission", e))?;
    }

    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM group_permissions WHERE grp = ");
    qb.push_bind(group.id().to_string());
    push_not_in(&mut qb, "perm", group.permissions().iter().map(|p| p.as_str().to_string()));
    qb.build()
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("prune_grants", e))?;

    for perm in group.permissions() {
        sqlx::query(
            "INSERT INTO group_permissions (grp, perm, created) VALUES (?, ?, ?) ON CONFLICT (grp, perm) DO NOTHING",
        )
        .bind(group.id().as_str())
        .bind(perm.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("insert_grant", e))?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A `groups ⟕ group_permissions` row; also the cached grants format.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct GrantRow {
    grp: String,
    name: String,
    perm: Option<String>,
}

/// Append ` AND {column} NOT IN (...)` unless `values` is empty.
fn push_not_in(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: impl Iterator<Item = String>) {
    let values: Vec<String> = values.collect();
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} NOT IN ("));
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value);
    }
    list.push_unseparated(")");
}

/// JSON path for a dotted data-bag field, e.g. `profile.city` → `$.profile.city`.
fn json_path(field: &str) -> Result<String, AuthError> {
    let valid = !field.is_empty()
        && !field.starts_with('.')
        && !field.ends_with('.')
        && !field.contains("..")
        && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(format!("$.{field}"))
    } else {
        Err(AuthError::invalid_filter(format!("unsupported field name '{field}'")))
    }
}

fn provider_from_row(row: &SqliteRow) -> StoreResult<ProviderLink> {
    let read = |e| map_sqlx_error("load_user_providers", e);
    let data: Option<String> = row.try_get("data").map_err(read)?;
    let data = data
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .map_err(|e| decode_error("load_user_providers", e))?;
    Ok(ProviderLink {
        provider: row.try_get("provider").map_err(read)?,
        external_id: row.try_get("id").map_err(read)?,
        display_name: row.try_get("name").map_err(read)?,
        data,
        created_at: row.try_get::<DateTime<Utc>, _>("created").map_err(read)?,
        last_used_at: row.try_get::<Option<DateTime<Utc>>, _>("used").map_err(read)?,
        disabled: row.try_get("disabled").map_err(read)?,
    })
}

fn decode_error(operation: &'static str, err: serde_json::Error) -> StoreError {
    map_sqlx_error(operation, sqlx::Error::Decode(Box::new(err)))
}

#[cfg(test)]
mod tests;
