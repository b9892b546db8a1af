use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Store key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// The encrypted file exists but cannot be decrypted or parsed. Never
    /// recoverable: the caller must not continue with a replacement store.
    #[error("Encrypted store is unreadable: {0}")]
    Corrupt(String),

    #[error("Unsupported store format version {0}")]
    UnsupportedVersion(u32),

    /// Another handle, usually a running service, holds the store lock.
    #[error("Event store is in use by another process ({})", .0.display())]
    Locked(PathBuf),

    #[error("Discovery event has an empty peer id")]
    EmptyPeerId,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
