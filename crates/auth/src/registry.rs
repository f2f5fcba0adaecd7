//! In-memory authorization graph.
//!
//! The registry owns every cached group and user plus the permission
//! catalog. Without a store attached it is the source of truth; with one, the
//! persistence layer keeps it in step with the rows it writes.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::debug;

use warden_core::{AuthError, AuthResult, GroupId, UserId};

use crate::{Group, IdentityClaims, Permission, PermissionSet, User};

type ProviderKey = (String, String);

#[derive(Debug, Default)]
pub struct Registry {
    groups: BTreeMap<GroupId, Group>,
    users: HashMap<UserId, User>,
    permissions: PermissionSet,
    provider_index: HashMap<ProviderKey, UserId>,
}

impl Registry {
    /// Build a registry from known groups and a permission catalog.
    ///
    /// Permissions granted to the groups are catalogued as well.
    pub fn new<P: Into<Permission>>(
        groups: impl IntoIterator<Item = Group>,
        permissions: impl IntoIterator<Item = P>,
    ) -> Self {
        let mut registry = Self {
            permissions: permissions.into_iter().collect(),
            ..Default::default()
        };
        for group in groups {
            registry.catalogue(&group);
            registry.groups.insert(group.id().clone(), group);
        }
        registry
    }

    fn catalogue(&mut self, group: &Group) {
        self.permissions.extend(group.permissions().iter().cloned());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Permission catalog
    // ─────────────────────────────────────────────────────────────────────

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn permission_exists(&self, name: &str) -> bool {
        self.permissions.contains(name)
    }

    pub fn add_permission(&mut self, permission: impl Into<Permission>) -> AuthResult<()> {
        let permission = permission.into();
        if self.permissions.contains(permission.as_str()) {
            return Err(AuthError::already_exists(format!("permission '{permission}'")));
        }
        self.permissions.insert(permission);
        Ok(())
    }

    /// Remove a permission from the catalog and from every group granting it.
    pub fn delete_permission(&mut self, name: &str) -> AuthResult<()> {
        if !self.permissions.remove(name) {
            return Err(AuthError::not_found(format!("permission '{name}'")));
        }
        for group in self.groups.values_mut() {
            if group.revoke(name) {
                debug!(group = %group.id(), permission = name, "grant revoked");
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group_exists(&self, id: &GroupId) -> bool {
        self.groups.contains_key(id)
    }

    pub fn get_group(&self, id: &GroupId) -> AuthResult<&Group> {
        self.groups
            .get(id)
            .ok_or_else(|| AuthError::not_found(format!("group {id}")))
    }

    /// Insert or replace a group. Its permissions join the catalog; nothing
    /// is ever removed from the catalog here.
    pub fn save_group(&mut self, group: Group) {
        self.catalogue(&group);
        self.groups.insert(group.id().clone(), group);
    }

    /// Remove a group and every cached membership in it.
    pub fn delete_group(&mut self, id: &GroupId) -> AuthResult<Group> {
        let group = self
            .groups
            .remove(id)
            .ok_or_else(|| AuthError::not_found(format!("group {id}")))?;
        for user in self.users.values_mut() {
            user.remove_group(id);
        }
        Ok(group)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_exists(&self, id: &UserId) -> bool {
        self.users.contains_key(id)
    }

    pub fn get_user(&self, id: &UserId) -> AuthResult<&User> {
        self.users
            .get(id)
            .ok_or_else(|| AuthError::not_found(format!("user {id}")))
    }

    /// Check that every group the user references is known.
    pub fn validate_user(&self, user: &User) -> AuthResult<()> {
        if let Some(missing) = user.groups().iter().find(|g| !self.groups.contains_key(*g)) {
            return Err(AuthError::invalid_state(format!("unknown group {missing}")));
        }
        Ok(())
    }

    /// Insert or replace a user, assigning a fresh id when it has none.
    ///
    /// Provider pairs already indexed for another user stay with that user.
    pub fn save_user(&mut self, user: &mut User) -> AuthResult<UserId> {
        self.validate_user(user)?;
        let id = match user.id() {
            Some(id) => id.clone(),
            None => {
                let id = UserId::generate();
                user.set_id(id.clone());
                id
            }
        };

        if let Some(previous) = self.users.get(&id) {
            for link in previous.providers() {
                let key = link.key();
                if user.provider(&link.provider, &link.external_id).is_none()
                    && self.provider_index.get(&key) == Some(&id)
                {
                    self.provider_index.remove(&key);
                }
            }
        }
        for link in user.providers() {
            match self.provider_index.get(&link.key()) {
                Some(owner) if owner != &id => {
                    debug!(
                        provider = %link.provider,
                        external_id = %link.external_id,
                        owner = %owner,
                        "provider pair already owned; not re-indexed"
                    );
                }
                Some(_) => {}
                None => {
                    self.provider_index.insert(link.key(), id.clone());
                }
            }
        }

        self.users.insert(id.clone(), user.clone());
        Ok(id)
    }

    pub fn delete_user(&mut self, id: &UserId) -> AuthResult<User> {
        self.forget_user(id)
            .ok_or_else(|| AuthError::not_found(format!("user {id}")))
    }

    /// Drop a user and its index entries from memory, if cached.
    pub fn forget_user(&mut self, id: &UserId) -> Option<User> {
        let user = self.users.remove(id)?;
        self.provider_index.retain(|_, owner| owner != id);
        Some(user)
    }

    /// Find the user owning an enabled `(provider, external_id)` link and
    /// stamp the link as used.
    pub fn get_user_by_provider_id(&mut self, provider: &str, external_id: &str) -> AuthResult<&User> {
        let not_found = || AuthError::not_found(format!("provider link {provider}:{external_id}"));
        let owner = self
            .provider_index
            .get(&(provider.to_string(), external_id.to_string()))
            .ok_or_else(not_found)?;
        let user = self.users.get_mut(owner).ok_or_else(not_found)?;
        let link = user
            .provider_mut(provider, external_id)
            .filter(|l| l.is_enabled())
            .ok_or_else(not_found)?;
        link.touch(Utc::now());
        Ok(user)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Derived permissions
    // ─────────────────────────────────────────────────────────────────────

    /// Whether any of the user's groups grants `name`.
    ///
    /// Names missing from the catalog are never granted.
    pub fn has_permission(&self, user: &User, name: &str) -> bool {
        if !self.permissions.contains(name) {
            return false;
        }
        user.groups()
            .iter()
            .filter_map(|g| self.groups.get(g))
            .any(|g| g.has_permission(name))
    }

    /// Union of the permissions of the user's groups.
    pub fn permissions_of(&self, user: &User) -> PermissionSet {
        user.groups()
            .iter()
            .filter_map(|g| self.groups.get(g))
            .flat_map(|g| g.permissions().iter().cloned())
            .collect()
    }

    /// Resolve the user behind verified identity claims, registering a new
    /// one when `register` is set.
    pub fn user_for_identity(&mut self, identity: &IdentityClaims, register: bool) -> AuthResult<User> {
        let (provider, external_id) = identity.provider_key()?;
        let found = self.get_user_by_provider_id(provider, external_id).cloned();
        match found {
            Ok(user) => Ok(user),
            Err(err) if err.is_not_found() && register => {
                let mut user = identity.registration()?;
                self.save_user(&mut user)?;
                debug!(provider, external_id, "registered user from identity");
                Ok(user)
            }
            Err(err) => Err(err),
        }
    }
}
