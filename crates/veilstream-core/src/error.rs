//! Error types for Veilstream

use thiserror::Error;

/// Main error type for Veilstream operations
#[derive(Error, Debug)]
pub enum VeilError {
    /// Builder call is not valid in the current policy state
    #[error("Invalid builder state: {0}")]
    InvalidBuilderState(String),

    /// Key material slice passed to the builder was empty
    #[error("Empty {0} set")]
    EmptyRecipientSet(&'static str),

    /// Encrypted message was created without any group or recipient
    #[error("Encrypted message defines no group or recipients")]
    MissingRecipients,

    /// String is not valid trytes
    #[error("Invalid trytes: {0}")]
    InvalidTrytes(String),

    /// Tryte/byte transcoding failed
    #[error("Transcoding error: {0}")]
    Transcoding(String),

    /// Channel is not known to this engine
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Endpoint is not known to this engine
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Bundle was published on a channel this engine does not trust
    #[error("Untrusted channel: {0}")]
    UntrustedChannel(String),

    /// Bundle was published on an endpoint with no prior announcement
    #[error("Untrusted endpoint: {0}")]
    UntrustedEndpoint(String),

    /// One-time key budget of the channel or endpoint is spent
    #[error("Channel exhausted: {0}")]
    ChannelExhausted(String),

    /// Sequence handle does not belong to this engine's state
    #[error("Invalid sequence handle: {0}")]
    InvalidSequenceHandle(String),

    /// No registered key can unwrap the message session key
    #[error("No decryption key for this message")]
    NoDecryptionKey,

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Integrity checksum did not match the packet contents
    #[error("Integrity check failed")]
    IntegrityCheckFailed,

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Wire protocol version not supported
    #[error("Wire version {0} is not supported")]
    VersionUnsupported(u8),

    /// Engine context was destroyed
    #[error("Engine context destroyed")]
    ContextDestroyed,

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Ledger transport operation failed
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Bundle contains no transactions
    #[error("Bundle is empty")]
    EmptyBundle,

    /// Stream operation requires an open stream
    #[error("Stream is not open")]
    StreamNotOpen,

    /// Stream was already opened
    #[error("Stream is already open")]
    StreamAlreadyOpen,
}

/// Result type alias using VeilError
pub type VeilResult<T> = Result<T, VeilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VeilError::UnknownChannel("VEIL9CHANNEL".to_string());
        assert_eq!(format!("{}", err), "Unknown channel: VEIL9CHANNEL");
    }

    #[test]
    fn test_version_display() {
        let err = VeilError::VersionUnsupported(9);
        assert_eq!(format!("{}", err), "Wire version 9 is not supported");
    }
}
