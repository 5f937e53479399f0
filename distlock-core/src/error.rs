//! Error types.

use std::fmt;

/// Why a `lock` call was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Discovery has not completed for the resource.
    UnknownOwner { resource: String },
    /// The resource was marked unreachable by prior failure analysis;
    /// the state is terminal.
    Unreachable { resource: String },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::UnknownOwner { resource } => {
                write!(
                    f,
                    "cannot lock '{resource}': owner is unknown, perform discovery first"
                )
            }
            LockError::Unreachable { resource } => {
                write!(f, "cannot lock '{resource}': resource is unreachable")
            }
        }
    }
}

impl std::error::Error for LockError {}

/// Archive encode/decode failure (see [`crate::codec`]).
#[derive(Debug)]
pub enum ArchiveError {
    Serialize(postcard::Error),
    Deserialize(postcard::Error),
    Encoding(bs58::decode::Error),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::Serialize(e) => write!(f, "archive serialization failed: {e}"),
            ArchiveError::Deserialize(e) => write!(f, "archive deserialization failed: {e}"),
            ArchiveError::Encoding(e) => write!(f, "archive text encoding invalid: {e}"),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Serialize(e) | ArchiveError::Deserialize(e) => Some(e),
            ArchiveError::Encoding(e) => Some(e),
        }
    }
}

/// An envelope whose content does not match the grammar for its
/// `(performative, protocol)` pair. Such messages are dropped without
/// mutating engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedMessage {
    pub detail: String,
}

impl MalformedMessage {
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed message content: {}", self.detail)
    }
}

impl std::error::Error for MalformedMessage {}

impl From<ArchiveError> for MalformedMessage {
    fn from(e: ArchiveError) -> Self {
        Self::new(e.to_string())
    }
}
