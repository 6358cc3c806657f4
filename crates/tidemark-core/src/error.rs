//! Error types for Tidemark

use thiserror::Error;

/// Top-level error type for Tidemark
#[derive(Debug, Error)]
pub enum TidemarkError {
    #[error("Verification error: {0}")]
    Verification(#[from] VerificationError),

    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors related to signatures and identity proofs
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Signature verification failed for signer {0}")]
    BadSignature(String),

    #[error("Signer not known: {0}")]
    UnknownSigner(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Identity proof failed: {0}")]
    IdentityProofFailed(String),

    #[error("Connection is not verified")]
    Unverified,
}

/// Errors related to access control
#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("Signer {signer} lacks {required} permission in group {group}")]
    Insufficient {
        signer: String,
        group: String,
        required: String,
    },

    #[error("Not a member of group {0}")]
    NotMember(String),
}

/// Errors related to protocol and change-record consistency
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{0} is not a remotely callable function")]
    NotCallable(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Change targets group {change_group} but subject belongs to {subject_group}")]
    GroupMismatch {
        change_group: String,
        subject_group: String,
    },

    #[error("Group reassignment must be a delete in the old group plus a create in the new group")]
    GroupReassignment,

    #[error("Subject {subject} is tombstoned in group {group}")]
    Tombstoned { subject: String, group: String },

    #[error("Timestamp {0} exceeds the representable block range")]
    BlockOverflow(u64),
}

/// Errors related to transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Call {0} timed out")]
    Timeout(String),

    #[error("Backoff ceiling exceeded after {0}ms")]
    BackoffCeiling(u64),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Channel not available: {0}")]
    ChannelUnavailable(String),

    #[error("Remote error: {0}")]
    Remote(String),
}

/// Errors for missing subjects or groups referenced by a change
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("Object not found: {0}")]
    Object(String),

    #[error("Group not found: {0}")]
    Group(String),

    #[error("Change record not found: {0}")]
    Change(String),
}

/// Errors related to storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Tidemark operations
pub type TidemarkResult<T> = Result<T, TidemarkError>;
