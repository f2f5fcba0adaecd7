//! Named permission bundles.

use serde::{Deserialize, Serialize};

use warden_core::{AuthError, AuthResult, GroupId};

use crate::{Permission, PermissionSet};

/// A named group owning a set of permissions.
///
/// Users reference groups by id; the group itself is owned by the
/// [`Registry`](crate::Registry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    id: GroupId,
    name: String,
    permissions: PermissionSet,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            permissions: PermissionSet::new(),
        }
    }

    pub fn with_permissions<P: Into<Permission>>(mut self, permissions: impl IntoIterator<Item = P>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn permissions(&self) -> &PermissionSet {
        &self.permissions
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.contains(name)
    }

    /// Grant a permission. Granting twice is a no-op.
    pub fn add_permission(&mut self, permission: impl Into<Permission>) {
        self.permissions.insert(permission);
    }

    /// Drop a permission if granted; reports whether it was.
    pub fn revoke(&mut self, name: &str) -> bool {
        self.permissions.remove(name)
    }

    pub fn remove_permission(&mut self, name: &str) -> AuthResult<()> {
        if self.revoke(name) {
            Ok(())
        } else {
            Err(AuthError::not_found(format!(
                "permission '{name}' in group {}",
                self.id
            )))
        }
    }
}
