//! Token issuance and verification.

use serde_json::{Map, Value};
use tracing::debug;

use warden_core::{AuthError, AuthResult};

use crate::{
    Aes256GcmCipher, HmacSha256Signer, ProviderLink, RequestContext, Token, TokenCipher,
    TokenPolicy, TokenSigner, User, Validity,
};

/// Claims that name the identity and must be strings (or null).
pub const RESERVED_CLAIMS: [&str; 4] = ["provider", "id", "mail", "name"];

// ─────────────────────────────────────────────────────────────────────────────
// Identity claims
// ─────────────────────────────────────────────────────────────────────────────

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityClaims {
    pub provider: Option<String>,
    pub id: Option<String>,
    pub mail: Option<String>,
    pub name: Option<String>,
    /// Same as `id`; kept separate for callers that key on it.
    pub provider_id: Option<String>,
    /// Every claim, with reserved keys defaulted to null and `providerId` added.
    pub claims: Map<String, Value>,
}

fn reserved_str(claims: &Map<String, Value>, name: &str) -> AuthResult<Option<String>> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(AuthError::invalid_state(format!(
            "claim '{name}' must be a string or null, got {other}"
        ))),
    }
}

fn check_reserved(claims: &Map<String, Value>) -> AuthResult<()> {
    for name in RESERVED_CLAIMS {
        reserved_str(claims, name)?;
    }
    Ok(())
}

impl IdentityClaims {
    pub fn from_claims(mut claims: Map<String, Value>) -> AuthResult<Self> {
        let provider = reserved_str(&claims, "provider")?;
        let id = reserved_str(&claims, "id")?;
        let mail = reserved_str(&claims, "mail")?;
        let name = reserved_str(&claims, "name")?;
        for key in RESERVED_CLAIMS {
            claims.entry(key).or_insert(Value::Null);
        }
        claims.insert("providerId".into(), id.clone().map_or(Value::Null, Value::String));
        Ok(Self {
            provider,
            provider_id: id.clone(),
            id,
            mail,
            name,
            claims,
        })
    }

    /// The `(provider, providerId)` pair, required to resolve a user.
    pub fn provider_key(&self) -> AuthResult<(&str, &str)> {
        match (self.provider.as_deref(), self.provider_id.as_deref()) {
            (Some(p), Some(id)) if !p.is_empty() && !id.is_empty() => Ok((p, id)),
            _ => Err(AuthError::invalid_state("identity lacks provider or provider id")),
        }
    }

    /// A new, unsaved user carrying this identity's name, mail and provider link.
    pub fn registration(&self) -> AuthResult<User> {
        let (provider, external_id) = self.provider_key()?;
        let mut user = User::new();
        let mut link = ProviderLink::new(provider, external_id);
        if let Some(name) = &self.name {
            user.set("name", name.as_str())?;
            link = link.with_display_name(name.as_str());
        }
        if let Some(mail) = &self.mail {
            user.set("mail", mail.as_str())?;
        }
        user.add_provider(link)?;
        Ok(user)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authenticator
// ─────────────────────────────────────────────────────────────────────────────

/// Issues and verifies bearer tokens under a fixed [`TokenPolicy`].
pub struct Authenticator {
    policy: TokenPolicy,
    signer: Box<dyn TokenSigner>,
    cipher: Option<Box<dyn TokenCipher>>,
}

impl core::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Authenticator")
            .field("issuer", &self.policy.issuer)
            .field("algorithm", &self.signer.algorithm())
            .field("encrypted", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    /// HS256 signatures; AES-256-GCM sealing when the policy has an
    /// encryption key.
    pub fn new(policy: TokenPolicy) -> Self {
        let cipher = policy
            .encryption_key
            .as_deref()
            .map(|key| Box::new(Aes256GcmCipher::new(key)) as Box<dyn TokenCipher>);
        Self {
            policy,
            signer: Box::new(HmacSha256Signer),
            cipher,
        }
    }

    pub fn with_signer(mut self, signer: impl TokenSigner + 'static) -> Self {
        self.signer = Box::new(signer);
        self
    }

    pub fn with_cipher(mut self, cipher: impl TokenCipher + 'static) -> Self {
        self.cipher = Some(Box::new(cipher));
        self
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    /// Issue a token for `claims`, bound to `ctx` as the policy dictates.
    pub fn issue(
        &self,
        mut claims: Map<String, Value>,
        validity: Option<Validity>,
        ctx: &RequestContext,
    ) -> AuthResult<String> {
        check_reserved(&claims)?;
        let signing_key = self.policy.signing_keys.first();
        if self.policy.require_signature && signing_key.is_none() {
            return Err(AuthError::NoSigningKey);
        }

        let validity = validity.unwrap_or_else(|| self.policy.default_validity());
        let expires = validity.resolve(ctx.now)?;
        claims.insert("iat".into(), Value::from(ctx.now.timestamp()));
        claims.insert("exp".into(), Value::from(expires.timestamp()));
        if let Some(issuer) = &self.policy.issuer {
            claims.insert("iss".into(), Value::from(issuer.as_str()));
        }
        if self.policy.bind_ip {
            claims.insert("ip".into(), Value::from(ctx.ip.to_string()));
        }
        if self.policy.bind_user_agent {
            claims.insert("ua".into(), Value::from(ctx.user_agent.as_str()));
        }
        if self.policy.bind_session {
            if let Some(session) = &ctx.session_id {
                claims.insert("sess".into(), Value::from(session.as_str()));
            }
        }

        let mut token = Token::new(claims);
        if let Some(key) = signing_key {
            token.sign(self.signer.as_ref(), key)?;
        }
        let encoded = token.encode()?;
        match &self.cipher {
            Some(cipher) => cipher.encrypt(&encoded),
            None => Ok(encoded),
        }
    }

    /// Decrypt (when sealing is configured) and decode without verifying.
    pub fn decode(&self, raw: &str) -> AuthResult<Token> {
        match &self.cipher {
            Some(cipher) => Token::decode(&cipher.decrypt(raw)?),
            None => Token::decode(raw),
        }
    }

    pub fn verify(&self, raw: &str, ctx: &RequestContext) -> AuthResult<IdentityClaims> {
        let token = self.decode(raw)?;
        self.verify_token(&token, ctx)
    }

    /// Verify a decoded token against the policy and the current request.
    pub fn verify_token(&self, token: &Token, ctx: &RequestContext) -> AuthResult<IdentityClaims> {
        let keys = self.policy.signing_keys.as_slice();
        if self.policy.require_signature {
            if !token.is_signed() {
                return Err(AuthError::NotSigned);
            }
            if keys.is_empty() {
                return Err(AuthError::NoSigningKey);
            }
        }

        token.validate(ctx.now, &self.expected_claims(token, ctx))?;

        if token.is_signed() && !token.verify_signature(self.signer.as_ref(), keys) {
            debug!(algorithm = ?token.algorithm(), "token signature rejected");
            return Err(AuthError::InvalidSignature);
        }

        IdentityClaims::from_claims(token.claims().clone())
            .map_err(|e| AuthError::malformed(e.to_string()))
    }

    /// Bound claims are only checked when the token carries them, so tokens
    /// issued before a binding was switched on keep working.
    fn expected_claims(&self, token: &Token, ctx: &RequestContext) -> Map<String, Value> {
        let mut expected = Map::new();
        if let Some(issuer) = &self.policy.issuer {
            expected.insert("iss".into(), Value::from(issuer.as_str()));
        }
        let carries = |name: &str| {
            token
                .claim(name)
                .and_then(Value::as_str)
                .is_some_and(|v| !v.is_empty())
        };
        if carries("ip") {
            expected.insert("ip".into(), Value::from(ctx.ip.to_string()));
        }
        if carries("ua") {
            expected.insert("ua".into(), Value::from(ctx.user_agent.as_str()));
        }
        if carries("sess") {
            let session = ctx.session_id.as_deref().unwrap_or_default();
            expected.insert("sess".into(), Value::from(session));
        }
        expected
    }
}
