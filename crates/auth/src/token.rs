//! Compact token codec.
//!
//! Wire format is the JWS compact serialization:
//! `b64url(header).b64url(claims).b64url(signature)`. Unsigned tokens carry
//! `"alg": "none"` and an empty signature segment. The whole string can be
//! sealed with a [`TokenCipher`].
//!
//! Algorithms are collaborators: [`TokenSigner`] and [`TokenCipher`] hide the
//! primitives, and the defaults wrap `hmac`/`sha2` and `aes-gcm`.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use warden_core::{AuthError, AuthResult};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators
// ─────────────────────────────────────────────────────────────────────────────

/// Produces and checks token signatures.
pub trait TokenSigner: Send + Sync {
    /// Value written to the `alg` header.
    fn algorithm(&self) -> &'static str;

    fn sign(&self, input: &[u8], key: &[u8]) -> AuthResult<Vec<u8>>;

    fn verify(&self, input: &[u8], signature: &[u8], key: &[u8]) -> bool;
}

/// HMAC-SHA256 (`HS256`).
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacSha256Signer;

impl TokenSigner for HmacSha256Signer {
    fn algorithm(&self) -> &'static str {
        "HS256"
    }

    fn sign(&self, input: &[u8], key: &[u8]) -> AuthResult<Vec<u8>> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| AuthError::invalid_state(format!("hmac key rejected: {e}")))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, input: &[u8], signature: &[u8], key: &[u8]) -> bool {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
            return false;
        };
        mac.update(input);
        mac.verify_slice(signature).is_ok()
    }
}

/// Symmetric sealing of a whole encoded token.
pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> AuthResult<String>;

    /// Any failure (bad encoding, wrong key, tampering) is `MalformedToken`.
    fn decrypt(&self, sealed: &str) -> AuthResult<String>;
}

/// AES-256-GCM keyed by the SHA-256 digest of a passphrase.
///
/// Output is `b64url(nonce || ciphertext)` with a random 96-bit nonce.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }
}

impl core::fmt::Debug for Aes256GcmCipher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Aes256GcmCipher").finish_non_exhaustive()
    }
}

impl TokenCipher for Aes256GcmCipher {
    fn encrypt(&self, plaintext: &str) -> AuthResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| AuthError::invalid_state("token encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    fn decrypt(&self, sealed: &str) -> AuthResult<String> {
        let bytes = URL_SAFE_NO_PAD
            .decode(sealed.trim())
            .map_err(|e| AuthError::malformed(format!("sealed token is not base64url: {e}")))?;
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(AuthError::malformed("sealed token too short"));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::malformed("sealed token failed to decrypt"))?;
        String::from_utf8(plaintext).map_err(|_| AuthError::malformed("sealed token is not utf-8"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validity
// ─────────────────────────────────────────────────────────────────────────────

/// How long an issued token stays valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// Relative to issuance; may be negative.
    Seconds(i64),
    /// Absolute expiration.
    Until(DateTime<Utc>),
    /// RFC 3339 timestamp, `now`, or a relative amount such as `+2 hours`,
    /// `-1 day` or `30m`.
    Expression(String),
}

impl Validity {
    pub fn resolve(&self, now: DateTime<Utc>) -> AuthResult<DateTime<Utc>> {
        match self {
            Self::Seconds(secs) => shift(now, *secs, 1),
            Self::Until(at) => Ok(*at),
            Self::Expression(expr) => resolve_expression(expr, now),
        }
    }
}

impl From<i64> for Validity {
    fn from(value: i64) -> Self {
        Self::Seconds(value)
    }
}

impl From<DateTime<Utc>> for Validity {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Until(value)
    }
}

impl From<&str> for Validity {
    fn from(value: &str) -> Self {
        Self::Expression(value.to_string())
    }
}

fn shift(now: DateTime<Utc>, amount: i64, unit_secs: i64) -> AuthResult<DateTime<Utc>> {
    let overflow = || AuthError::invalid_expiration(format!("{amount} x {unit_secs}s overflows"));
    let secs = amount.checked_mul(unit_secs).ok_or_else(overflow)?;
    let delta = Duration::try_seconds(secs).ok_or_else(overflow)?;
    now.checked_add_signed(delta).ok_or_else(overflow)
}

fn unit_seconds(unit: &str) -> Option<i64> {
    let secs = match unit {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        _ => return None,
    };
    Some(secs)
}

fn resolve_expression(expr: &str, now: DateTime<Utc>) -> AuthResult<DateTime<Utc>> {
    let trimmed = expr.trim();
    if trimmed.eq_ignore_ascii_case("now") {
        return Ok(now);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(at.with_timezone(&Utc));
    }

    let invalid = || AuthError::invalid_expiration(format!("cannot resolve '{expr}'"));
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (false, &trimmed[1..]),
        Some(b'-') => (true, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let rest = rest.trim_start();
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return Err(invalid());
    }
    let amount: i64 = rest[..digits_end].parse().map_err(|_| invalid())?;
    let unit = rest[digits_end..].trim().to_ascii_lowercase();
    let unit_secs = unit_seconds(&unit).ok_or_else(invalid)?;
    shift(now, if negative { -amount } else { amount }, unit_secs)
}

// ─────────────────────────────────────────────────────────────────────────────
// Token
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded (or not yet encoded) token.
///
/// A decoded token keeps the exact header/claims segments it arrived with so
/// signatures from other issuers verify byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    header: Map<String, Value>,
    claims: Map<String, Value>,
    signature: Vec<u8>,
    signing_input: Option<String>,
}

impl Token {
    pub fn new(claims: Map<String, Value>) -> Self {
        let mut header = Map::new();
        header.insert("typ".into(), Value::from("JWT"));
        header.insert("alg".into(), Value::from("none"));
        Self {
            header,
            claims,
            signature: Vec::new(),
            signing_input: None,
        }
    }

    pub fn header(&self) -> &Map<String, Value> {
        &self.header
    }

    pub fn algorithm(&self) -> Option<&str> {
        self.header.get("alg").and_then(Value::as_str)
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name).filter(|v| !v.is_null())
    }

    /// Mutable claims. Any existing signature is discarded.
    pub fn claims_mut(&mut self) -> &mut Map<String, Value> {
        self.unsign();
        &mut self.claims
    }

    pub fn into_claims(self) -> Map<String, Value> {
        self.claims
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    fn unsign(&mut self) {
        self.signature.clear();
        self.signing_input = None;
        self.header.insert("alg".into(), Value::from("none"));
    }

    fn segments(&self) -> AuthResult<String> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| AuthError::invalid_state(format!("header not serializable: {e}")))?;
        let claims = serde_json::to_vec(&self.claims)
            .map_err(|e| AuthError::invalid_state(format!("claims not serializable: {e}")))?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        ))
    }

    pub fn sign(&mut self, signer: &dyn TokenSigner, key: &str) -> AuthResult<()> {
        self.header.insert("alg".into(), Value::from(signer.algorithm()));
        let input = self.segments()?;
        self.signature = signer.sign(input.as_bytes(), key.as_bytes())?;
        self.signing_input = Some(input);
        Ok(())
    }

    /// True when the header names `signer`'s algorithm and any of `keys`
    /// verifies the signature.
    pub fn verify_signature<K: AsRef<str>>(&self, signer: &dyn TokenSigner, keys: &[K]) -> bool {
        let Some(input) = self.signing_input.as_deref() else {
            return false;
        };
        if !self.is_signed() || self.algorithm() != Some(signer.algorithm()) {
            return false;
        }
        keys.iter()
            .any(|k| signer.verify(input.as_bytes(), &self.signature, k.as_ref().as_bytes()))
    }

    pub fn encode(&self) -> AuthResult<String> {
        match &self.signing_input {
            Some(input) if self.is_signed() => {
                Ok(format!("{input}.{}", URL_SAFE_NO_PAD.encode(&self.signature)))
            }
            _ => {
                let mut unsigned = self.clone();
                unsigned.unsign();
                Ok(format!("{}.", unsigned.segments()?))
            }
        }
    }

    pub fn decode(raw: &str) -> AuthResult<Self> {
        let raw = raw.trim();
        let mut parts = raw.split('.');
        let (Some(header), Some(claims), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::malformed("expected three dot-separated segments"));
        };

        let signing_input = raw[..header.len() + 1 + claims.len()].to_string();
        let header = decode_object(header, "header")?;
        let claims = decode_object(claims, "claims")?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| AuthError::malformed(format!("signature is not base64url: {e}")))?;

        Ok(Self {
            header,
            claims,
            signature,
            signing_input: Some(signing_input),
        })
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.claim("exp").and_then(numeric_date)
    }

    /// Check time bounds and that every `expected` claim matches exactly.
    ///
    /// A token without `exp` does not expire.
    pub fn validate(&self, now: DateTime<Utc>, expected: &Map<String, Value>) -> AuthResult<()> {
        let now = now.timestamp();
        if let Some(exp) = self.claims.get("exp") {
            let exp = numeric_date(exp).ok_or_else(|| AuthError::not_valid("exp is not a number"))?;
            if now >= exp {
                return Err(AuthError::not_valid("token has expired"));
            }
        }
        if let Some(nbf) = self.claim("nbf") {
            let nbf = numeric_date(nbf).ok_or_else(|| AuthError::not_valid("nbf is not a number"))?;
            if now < nbf {
                return Err(AuthError::not_valid("token is not valid yet"));
            }
        }
        for (name, want) in expected {
            if self.claims.get(name) != Some(want) {
                return Err(AuthError::not_valid(format!("claim '{name}' does not match")));
            }
        }
        Ok(())
    }
}

fn decode_object(segment: &str, what: &str) -> AuthResult<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::malformed(format!("{what} is not base64url: {e}")))?;
    match serde_json::from_slice(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AuthError::malformed(format!("{what} is not a JSON object"))),
        Err(e) => Err(AuthError::malformed(format!("{what} is not JSON: {e}"))),
    }
}

fn numeric_date(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}
