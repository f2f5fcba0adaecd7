//! Error model shared by the token protocol and the authorization graph.

use thiserror::Error;

/// Result type used across the identity/authorization layer.
pub type AuthResult<T> = Result<T, AuthError>;

/// Identity/authorization error.
///
/// Every failure mode is its own variant so callers can tell "not logged in"
/// from "tampered token" from "expired" without string matching.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// An entity (user, group, permission, provider link) is absent.
    ///
    /// Persistence layers use this to trigger hydration from storage.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create collided with an existing entity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An operation would break an invariant (e.g. primary group outside membership).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The token could not be decoded or decrypted.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// Signatures are mandatory but the token carries none.
    #[error("token is not signed")]
    NotSigned,

    /// Signatures are mandatory but no signing key is configured.
    #[error("no signing key configured")]
    NoSigningKey,

    /// No configured key verifies the token signature.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token is expired, not yet valid, or its claims do not match.
    #[error("token not valid: {0}")]
    TokenNotValid(String),

    /// A validity expression could not be resolved to an absolute time.
    #[error("invalid expiration: {0}")]
    InvalidExpiration(String),

    /// A search query could not be translated.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
}

/// Payload-free discriminant of [`AuthError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    MalformedToken,
    NotSigned,
    NoSigningKey,
    InvalidSignature,
    TokenNotValid,
    InvalidExpiration,
    InvalidFilter,
}

impl AuthError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedToken(msg.into())
    }

    pub fn not_valid(msg: impl Into<String>) -> Self {
        Self::TokenNotValid(msg.into())
    }

    pub fn invalid_expiration(msg: impl Into<String>) -> Self {
        Self::InvalidExpiration(msg.into())
    }

    pub fn invalid_filter(msg: impl Into<String>) -> Self {
        Self::InvalidFilter(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::MalformedToken(_) => ErrorKind::MalformedToken,
            Self::NotSigned => ErrorKind::NotSigned,
            Self::NoSigningKey => ErrorKind::NoSigningKey,
            Self::InvalidSignature => ErrorKind::InvalidSignature,
            Self::TokenNotValid(_) => ErrorKind::TokenNotValid,
            Self::InvalidExpiration(_) => ErrorKind::InvalidExpiration,
            Self::InvalidFilter(_) => ErrorKind::InvalidFilter,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(AuthError::not_found("user 7").kind(), ErrorKind::NotFound);
        assert_eq!(AuthError::NotSigned.kind(), ErrorKind::NotSigned);
        assert_eq!(
            AuthError::not_valid("expired").kind(),
            ErrorKind::TokenNotValid
        );
    }

    #[test]
    fn display_carries_context() {
        let err = AuthError::invalid_state("primary group 3 is not a membership");
        assert_eq!(
            err.to_string(),
            "invalid state: primary group 3 is not a membership"
        );
        assert!(AuthError::not_found("group 1").is_not_found());
        assert!(!AuthError::InvalidSignature.is_not_found());
    }
}
