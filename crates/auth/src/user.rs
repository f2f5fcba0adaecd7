//! Users: identity, nested profile data, group memberships and provider links.
//!
//! A user never stores permissions. What a user may do is derived from the
//! groups it belongs to, resolved through the [`Registry`](crate::Registry).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::{AuthError, AuthResult, DataBag, GroupId, UserId};

use crate::ProviderLink;

/// A user of the host application.
///
/// # Invariants
/// - `primary_group`, when set, is one of `groups`.
/// - No two provider links share the same `(provider, external_id)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    id: Option<UserId>,
    data: DataBag,
    groups: BTreeSet<GroupId>,
    primary_group: Option<GroupId>,
    providers: Vec<ProviderLink>,
}

impl User {
    /// A user without an id; the id is assigned on first save.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: UserId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn id(&self) -> Option<&UserId> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: UserId) {
        self.id = Some(id);
    }

    pub fn clear_id(&mut self) {
        self.id = None;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Data bag
    // ─────────────────────────────────────────────────────────────────────

    pub fn data(&self) -> &DataBag {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataBag {
        &mut self.data
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.data.get(path)
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> AuthResult<()> {
        self.data.set(path, value)
    }

    pub fn delete(&mut self, path: &str) -> Option<Value> {
        self.data.delete(path)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    pub fn groups(&self) -> &BTreeSet<GroupId> {
        &self.groups
    }

    pub fn in_group(&self, group: &GroupId) -> bool {
        self.groups.contains(group)
    }

    /// Join a group. Returns `false` if already a member.
    pub fn add_group(&mut self, group: GroupId) -> bool {
        self.groups.insert(group)
    }

    /// Leave a group, clearing the primary group if it was this one.
    pub fn remove_group(&mut self, group: &GroupId) -> bool {
        if self.primary_group.as_ref() == Some(group) {
            self.primary_group = None;
        }
        self.groups.remove(group)
    }

    pub fn primary_group(&self) -> Option<&GroupId> {
        self.primary_group.as_ref()
    }

    pub fn set_primary_group(&mut self, group: Option<GroupId>) -> AuthResult<()> {
        if let Some(g) = &group {
            if !self.groups.contains(g) {
                return Err(AuthError::invalid_state(format!(
                    "primary group {g} is not one of the user's groups"
                )));
            }
        }
        self.primary_group = group;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Provider links
    // ─────────────────────────────────────────────────────────────────────

    pub fn providers(&self) -> &[ProviderLink] {
        &self.providers
    }

    pub fn provider(&self, provider: &str, external_id: &str) -> Option<&ProviderLink> {
        self.providers.iter().find(|l| l.matches(provider, external_id))
    }

    pub fn provider_mut(&mut self, provider: &str, external_id: &str) -> Option<&mut ProviderLink> {
        self.providers.iter_mut().find(|l| l.matches(provider, external_id))
    }

    pub fn add_provider(&mut self, link: ProviderLink) -> AuthResult<()> {
        if self.provider(&link.provider, &link.external_id).is_some() {
            return Err(AuthError::already_exists(format!(
                "provider link {}:{}",
                link.provider, link.external_id
            )));
        }
        self.providers.push(link);
        Ok(())
    }

    pub fn remove_provider(&mut self, provider: &str, external_id: &str) -> Option<ProviderLink> {
        let pos = self.providers.iter().position(|l| l.matches(provider, external_id))?;
        Some(self.providers.remove(pos))
    }
}
