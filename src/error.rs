//! Error types for loraflow
//!
//! Every concern has its own error enum; [`LoraError`] wraps them all so
//! that helpers can use `?` across concerns. Pipeline stages never hand
//! these errors to a caller: they log them and drop the affected frame.

use crate::protocol::{DevNonce, Eui64, MType};
use thiserror::Error;

/// Result type alias for loraflow operations
pub type Result<T> = std::result::Result<T, LoraError>;

/// Main error type for loraflow operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoraError {
    /// Frame decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Frame encoding error
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    /// MIC / encryption error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// OTAA join rejected
    #[error("Join rejected: {0}")]
    Join(#[from] JoinError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Pipeline channel closed
    #[error("Pipeline closed")]
    PipelineClosed,
}

/// Errors while parsing frames or identifiers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Buffer too short
    #[error("Buffer too short: need at least {needed} bytes, got {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Unsupported LoRaWAN major version
    #[error("Unsupported major version: {0}")]
    UnsupportedMajor(u8),

    /// A fixed-size payload had the wrong length
    #[error("Invalid {what} length: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Unknown MAC command identifier
    #[error("Unknown MAC command: 0x{0:02x}")]
    UnknownMacCommand(u8),

    /// MAC command payload cut short
    #[error("Truncated MAC command 0x{cid:02x} at offset {offset}")]
    TruncatedMacCommand { cid: u8, offset: usize },

    /// Invalid hexadecimal identifier
    #[error("Invalid hex identifier: {0}")]
    InvalidHex(String),
}

/// Errors while serializing outgoing frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// The message type is never sent by the network server
    #[error("Unsupported message type for encoding: {0}")]
    UnsupportedMType(MType),

    /// FOpts longer than the FCtrl field can describe
    #[error("FOpts too long: {0} bytes (max 15)")]
    FOptsTooLong(usize),

    /// Frame payload present without a port
    #[error("FRMPayload present without FPort")]
    MissingPort,
}

/// Errors from MIC computation and payload encryption
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    /// The operation does not apply to this frame type
    #[error("Operation not valid for {0} frames")]
    WrongFrameType(MType),

    /// Block cipher input not aligned to the AES block size
    #[error("Invalid block length: {0} bytes is not a multiple of 16")]
    InvalidBlockLength(usize),

    /// MIC did not verify
    #[error("MIC mismatch")]
    MicMismatch,
}

/// Errors reported by a [`Storage`](crate::storage::Storage) implementation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// No record for the key
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Record already exists (create-once semantics)
    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    /// Write refused because of conflicting state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Backend failure (I/O, serialization, poisoned lock)
    #[error("Backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    /// Create a not-found error
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        StorageError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: &'static str, key: impl ToString) -> Self {
        StorageError::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// Whether this is the well-defined "not found" signal
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// Whether this is the "already exists" signal
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StorageError::AlreadyExists { .. })
    }
}

/// Reasons an OTAA join request is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JoinError {
    /// DevEUI not provisioned
    #[error("Unknown device {0}")]
    UnknownDevice(Eui64),

    /// AppEUI in the request does not match the device
    #[error("AppEUI mismatch: device belongs to {expected}, request has {actual}")]
    ApplicationMismatch { expected: Eui64, actual: Eui64 },

    /// DevNonce already consumed
    #[error("DevNonce {nonce} already used by {dev_eui}")]
    DevNonceReused { dev_eui: Eui64, nonce: DevNonce },
}

/// Configuration loading / validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    /// JSON could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Value out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LoraError::Decode(DecodeError::BufferTooShort {
            needed: 12,
            available: 3,
        });
        let msg = format!("{}", err);
        assert!(msg.contains("too short"));
        assert!(msg.contains("12"));
    }

    #[test]
    fn test_error_conversion() {
        let storage_err = StorageError::not_found("device", "0102030405060708");
        let err: LoraError = storage_err.into();
        assert!(matches!(err, LoraError::Storage(ref e) if e.is_not_found()));
    }

    #[test]
    fn test_join_error_display() {
        let err = JoinError::DevNonceReused {
            dev_eui: Eui64([1, 2, 3, 4, 5, 6, 7, 8]),
            nonce: DevNonce(0x0102),
        };
        assert_eq!(
            err.to_string(),
            "DevNonce 0102 already used by 0102030405060708"
        );
    }
}
