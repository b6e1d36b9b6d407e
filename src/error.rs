//! Error types for the entity archive.

use crate::types::EntityId;
use thiserror::Error;

/// Main error type for store and container operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record type cannot be specialized: unsupported shape, missing
    /// foreign-key member, missing identity or missing target store.
    #[error("Configuration error on {record}{}: {message}", member_suffix(.member))]
    Configuration {
        record: &'static str,
        member: Option<String>,
        message: String,
    },

    #[error("Cannot delete {record} #{id}: {path} still references it; remove the reference first")]
    Integrity {
        record: &'static str,
        id: EntityId,
        path: String,
    },

    #[error("{record} #{id} is already present; use attach to overwrite it")]
    DuplicateIdentity { record: &'static str, id: EntityId },

    #[error("Decode error in {record} record {index} at byte {offset}: {message}")]
    Decode {
        record: &'static str,
        index: usize,
        offset: u64,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid archive format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Container is locked by another process")]
    Locked,

    #[error("Container not initialized")]
    NotInitialized,

    #[error("Container was closed while its stores were still in use")]
    ContainerClosed,
}

impl StoreError {
    pub(crate) fn config(
        record: &'static str,
        member: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        StoreError::Configuration {
            record,
            member: member.map(str::to_owned),
            message: message.into(),
        }
    }
}

fn member_suffix(member: &Option<String>) -> String {
    match member {
        Some(m) => format!(".{m}"),
        None => String::new(),
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
