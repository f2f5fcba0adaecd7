//! Process-wide logging setup for hosts embedding warden.

pub mod tracing;

pub use crate::tracing::{init, init_for_tests, init_with_default};
