use thiserror::Error;

pub type CgpiResult<T> = Result<T, CgpiError>;

#[derive(Debug, Error)]
pub enum CgpiError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid initialization vector length: expected {expected} bytes, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("invalid encryption header: {0}")]
    InvalidHeader(String),

    /// Fewer than tag-length bytes were left when the stream was finished.
    #[error("invalid tag: ciphertext ended before the authentication tag")]
    InvalidTag,

    /// The authentication tag did not verify. Never folded into empty output.
    #[error("authentication failed: ciphertext or tag has been tampered with")]
    AuthenticationFailed,

    #[error("engine is not ready (closed)")]
    NotReady,

    #[error("engine is not started")]
    NotStarted,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine busy: finish the running stream before closing")]
    EngineBusy,

    #[error("decryption in progress")]
    DecryptionInProgress,

    #[error("data key usage exceeded: {uses} of {max_uses} uses consumed")]
    UsageExceeded { uses: u32, max_uses: u32 },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("unsupported algorithm: {0}")]
    AlgorithmNotFound(String),

    #[error("key service unreachable: {0}")]
    KeyServiceUnreachable(String),

    #[error("key service error (HTTP {status}): {message}")]
    KeyServiceError { status: u16, message: String },

    #[error("data key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CgpiError {
    /// State-machine and length violations raised before any work is done.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CgpiError::NotReady
                | CgpiError::NotStarted
                | CgpiError::AlreadyStarted
                | CgpiError::EngineBusy
                | CgpiError::DecryptionInProgress
                | CgpiError::UsageExceeded { .. }
                | CgpiError::InvalidCredentials(_)
        )
    }

    /// Errors that originate from talking to the remote key service.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            CgpiError::KeyServiceUnreachable(_) | CgpiError::KeyServiceError { .. }
        )
    }
}
