//! External identity bindings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Binds a user to an identity at an external provider.
///
/// `(provider, external_id)` is unique across all users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderLink {
    pub provider: String,
    pub external_id: String,
    pub display_name: Option<String>,
    pub data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Soft delete: kept and persisted, but invisible to lookup-by-provider.
    pub disabled: bool,
}

impl ProviderLink {
    pub fn new(provider: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            external_id: external_id.into(),
            display_name: None,
            data: None,
            created_at: Utc::now(),
            last_used_at: None,
            disabled: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn matches(&self, provider: &str, external_id: &str) -> bool {
        self.provider == provider && self.external_id == external_id
    }

    /// The `(provider, external_id)` pair as owned strings.
    pub fn key(&self) -> (String, String) {
        (self.provider.clone(), self.external_id.clone())
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_used_at = Some(at);
    }
}
