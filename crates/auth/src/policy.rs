//! Token policy: what `Authenticator` signs, seals and binds.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Validity;

pub const DEFAULT_VALIDITY_SECS: i64 = 86_400;

/// Immutable token issuance/verification policy.
///
/// Encryption is opt-in: `encryption_key` is never derived from a signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
    pub issuer: Option<String>,
    /// The first key signs; every key is tried when verifying.
    pub signing_keys: Vec<String>,
    pub encryption_key: Option<String>,
    pub require_signature: bool,
    pub bind_ip: bool,
    pub bind_user_agent: bool,
    pub bind_session: bool,
    pub default_validity_secs: i64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            issuer: None,
            signing_keys: Vec::new(),
            encryption_key: None,
            require_signature: true,
            bind_ip: true,
            bind_user_agent: true,
            bind_session: true,
            default_validity_secs: DEFAULT_VALIDITY_SECS,
        }
    }
}

impl TokenPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `WARDEN_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a policy from a variable lookup. Unparsable values keep the
    /// default and are logged.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut policy = Self::default();
        if let Some(issuer) = lookup("WARDEN_ISSUER").filter(|v| !v.trim().is_empty()) {
            policy.issuer = Some(issuer.trim().to_string());
        }
        if let Some(keys) = lookup("WARDEN_SIGNING_KEYS") {
            policy.signing_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
        policy.encryption_key = lookup("WARDEN_ENCRYPTION_KEY").filter(|v| !v.is_empty());

        let flag = |name: &str, default: bool| match lookup(name) {
            None => default,
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                warn!(variable = name, value = %raw, "not a boolean; using default");
                default
            }),
        };
        policy.require_signature = flag("WARDEN_REQUIRE_SIGNATURE", policy.require_signature);
        policy.bind_ip = flag("WARDEN_BIND_IP", policy.bind_ip);
        policy.bind_user_agent = flag("WARDEN_BIND_USER_AGENT", policy.bind_user_agent);
        policy.bind_session = flag("WARDEN_BIND_SESSION", policy.bind_session);

        if let Some(raw) = lookup("WARDEN_TOKEN_VALIDITY_SECS") {
            match raw.trim().parse() {
                Ok(secs) => policy.default_validity_secs = secs,
                Err(_) => warn!(value = %raw, "WARDEN_TOKEN_VALIDITY_SECS is not an integer; using default"),
            }
        }
        policy
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_keys.push(key.into());
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn require_signature(mut self, required: bool) -> Self {
        self.require_signature = required;
        self
    }

    pub fn bind_ip(mut self, bind: bool) -> Self {
        self.bind_ip = bind;
        self
    }

    pub fn bind_user_agent(mut self, bind: bool) -> Self {
        self.bind_user_agent = bind;
        self
    }

    pub fn bind_session(mut self, bind: bool) -> Self {
        self.bind_session = bind;
        self
    }

    pub fn with_default_validity_secs(mut self, secs: i64) -> Self {
        self.default_validity_secs = secs;
        self
    }

    pub fn default_validity(&self) -> Validity {
        Validity::Seconds(self.default_validity_secs)
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
