//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The name contains a character outside the allowed set.
    #[error("invalid character {character:?} in {kind} '{actual}'")]
    InvalidCharacter {
        kind: &'static str,
        character: char,
        actual: String,
    },

    /// The numeric ID could not be parsed.
    #[error("invalid {kind}: '{actual}'")]
    InvalidNumber { kind: &'static str, actual: String },

    /// Zero is reserved as "no id".
    #[error("{kind} must be non-zero")]
    Zero { kind: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
