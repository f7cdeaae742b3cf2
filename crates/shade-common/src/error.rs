//! Error types for the shade engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A scan pattern produced no match in any profile. Non-fatal for the
    /// engine as a whole: consumers degrade the dependent feature.
    #[error("Pattern not found for symbol: {0}")]
    PatternNotFound(String),

    #[error("Remote allocation of {size:#x} bytes failed: {message}")]
    RemoteAllocation { size: usize, message: String },

    #[error("Remote read of {len:#x} bytes at {address:#x} failed: {message}")]
    RemoteRead {
        address: u64,
        len: usize,
        message: String,
    },

    #[error("Remote write of {len:#x} bytes at {address:#x} failed: {message}")]
    RemoteWrite {
        address: u64,
        len: usize,
        message: String,
    },

    #[error("Remote call did not signal completion within {ms} ms")]
    WaitTimeout { ms: u64 },

    #[error("No profile for OS version: {0}")]
    UnsupportedProfile(String),

    #[error("Worker creation failed: {0}")]
    WorkerFailed(String),

    #[error("Stub assembly failed: {0}")]
    Codegen(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
