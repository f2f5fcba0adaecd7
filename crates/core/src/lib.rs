//! `warden-core`: identity/authorization building blocks.
//!
//! Pure types only: error kinds, identifiers and the nested data bag. No I/O.

pub mod data;
pub mod error;
pub mod id;

pub use data::DataBag;
pub use error::{AuthError, AuthResult, ErrorKind};
pub use id::{GroupId, UserId};
