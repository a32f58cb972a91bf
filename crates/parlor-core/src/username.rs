//! Display names
//!
//! A username is 2-20 characters long and may not contain whitespace or any
//! of `/`, `\`, `:`. Uniqueness is case-insensitive, so every comparison goes
//! through [`Username::key`].

use std::fmt;

/// Minimum username length in characters
pub const MIN_USERNAME_LEN: usize = 2;
/// Maximum username length in characters
pub const MAX_USERNAME_LEN: usize = 20;

const FORBIDDEN: [char; 3] = ['/', '\\', ':'];

/// A validated display name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    /// Validate a proposed name
    pub fn parse(raw: &str) -> Result<Self, UsernameError> {
        let len = raw.chars().count();
        if len < MIN_USERNAME_LEN {
            return Err(UsernameError::TooShort(len));
        }
        if len > MAX_USERNAME_LEN {
            return Err(UsernameError::TooLong(len));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| c.is_whitespace() || FORBIDDEN.contains(c))
        {
            return Err(UsernameError::ForbiddenChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-folded form used for uniqueness checks and lookups
    pub fn key(&self) -> String {
        fold(&self.0)
    }
}

/// Case-fold a name the same way [`Username::key`] does
pub fn fold(name: &str) -> String {
    name.to_lowercase()
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Why a proposed username was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsernameError {
    #[error("username is too short ({0} characters, minimum 2)")]
    TooShort(usize),
    #[error("username is too long ({0} characters, maximum 20)")]
    TooLong(usize),
    #[error("username contains forbidden character {0:?}")]
    ForbiddenChar(char),
}
