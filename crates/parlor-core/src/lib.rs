//! Parlor core types
//!
//! Shared between the gateway and the terminal client: username rules and
//! the exact texts the hub sends to clients.

pub mod notice;
pub mod username;

pub use username::{fold, Username, UsernameError, MAX_USERNAME_LEN, MIN_USERNAME_LEN};

/// Prefix of every admission rejection notice.
///
/// The client treats a first frame starting with this prefix as fatal.
pub const ERROR_PREFIX: &str = "ERROR:";
