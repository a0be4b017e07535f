use thiserror::Error;

/// Errors raised by the protocol core.
///
/// Everything except `Repository` and `FatalConfig` is peer-local: the
/// offending frame or object is dropped and the node keeps running.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("proof of work does not meet target")]
    PowInvalid,

    #[error("invalid signature")]
    SignatureInvalid,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("object already known")]
    Duplicate,

    #[error("payload of {0} bytes exceeds maximum")]
    Oversize(usize),

    #[error("timed out")]
    Timeout,

    #[error("repository error: {0}")]
    Repository(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// A parse failure with context about what was being decoded.
    pub fn parse(what: impl Into<String>) -> Self {
        CoreError::Parse(what.into())
    }

    /// Whether the error must be surfaced to the host instead of being
    /// handled inside a peer session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::FatalConfig(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
