//! `warden-auth`: users, groups, permissions and bearer tokens.
//!
//! No I/O: persistence lives in `warden-infra`, which drives the
//! [`Registry`] defined here.

pub mod authenticator;
pub mod context;
pub mod group;
pub mod permissions;
pub mod policy;
pub mod provider;
pub mod registry;
pub mod token;
pub mod user;

pub use authenticator::{Authenticator, IdentityClaims, RESERVED_CLAIMS};
pub use context::RequestContext;
pub use group::Group;
pub use permissions::{Permission, PermissionSet};
pub use policy::TokenPolicy;
pub use provider::ProviderLink;
pub use registry::Registry;
pub use token::{Aes256GcmCipher, HmacSha256Signer, Token, TokenCipher, TokenSigner, Validity};
pub use user::User;
