//! Error taxonomy for the backup pipeline.
//!
//! Per-file problems never surface as `Err` past the orchestrator; they
//! become `failed` rows in the manifest. The variants here cover everything
//! that can fail a destination or the whole run.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance holds the lock (pid {pid})")]
    LockHeld { pid: i32 },

    #[error("source selection failed: {0}")]
    Selection(String),

    #[error("hook failed: {0}")]
    Hook(String),

    #[error("no encryption key material: {0}")]
    KeyMaterial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SSH transport error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("authentication failed for {0}")]
    Authentication(String),

    #[error("unknown or mismatched host key for {0}")]
    HostKey(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("restore error: {0}")]
    Restore(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
