use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShroudError>;

/// Stable classification of every failure the engine can surface.
///
/// Upstream callers dispatch on the kind (HTTP status mapping, retry
/// decisions); the variant message is for humans and logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Cancelled,
    Crypto,
    Authentication,
    Truncation,
    InvalidRange,
    RangeNotSatisfiable,
    MetadataTooLarge,
    MetadataMalformed,
    KmsUnavailable,
    KmsAuth,
    KmsNoSuchKey,
    KmsDecrypt,
    Config,
}

#[derive(Debug, Error)]
pub enum ShroudError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled or deadline exceeded")]
    Cancelled,

    #[error("cipher failure: {0}")]
    Crypto(String),

    #[error("chunk {chunk} failed authentication: ciphertext tampered or wrong key")]
    Authentication { chunk: u64 },

    #[error("encrypted stream truncated at chunk {chunk}: expected {expected} bytes, got {actual}")]
    Truncation {
        chunk: u64,
        expected: usize,
        actual: usize,
    },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("range {start}-{end} not satisfiable for size {size}")]
    RangeNotSatisfiable { start: u64, end: u64, size: u64 },

    #[error("encoded object metadata is {size} bytes, over the {budget}-byte budget")]
    MetadataTooLarge { size: usize, budget: usize },

    #[error("malformed object metadata: {0}")]
    MetadataMalformed(String),

    #[error("key manager unavailable: {0}")]
    KmsUnavailable(String),

    #[error("key manager rejected credentials: {0}")]
    KmsAuth(String),

    #[error("key manager has no such key: {0}")]
    KmsNoSuchKey(String),

    #[error("unable to unwrap data key after exhausting the dual-read window")]
    KmsDecrypt,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ShroudError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShroudError::Io(_) => ErrorKind::Io,
            ShroudError::Cancelled => ErrorKind::Cancelled,
            ShroudError::Crypto(_) => ErrorKind::Crypto,
            ShroudError::Authentication { .. } => ErrorKind::Authentication,
            ShroudError::Truncation { .. } => ErrorKind::Truncation,
            ShroudError::InvalidRange(_) => ErrorKind::InvalidRange,
            ShroudError::RangeNotSatisfiable { .. } => ErrorKind::RangeNotSatisfiable,
            ShroudError::MetadataTooLarge { .. } => ErrorKind::MetadataTooLarge,
            ShroudError::MetadataMalformed(_) => ErrorKind::MetadataMalformed,
            ShroudError::KmsUnavailable(_) => ErrorKind::KmsUnavailable,
            ShroudError::KmsAuth(_) => ErrorKind::KmsAuth,
            ShroudError::KmsNoSuchKey(_) => ErrorKind::KmsNoSuchKey,
            ShroudError::KmsDecrypt => ErrorKind::KmsDecrypt,
            ShroudError::Config(_) => ErrorKind::Config,
        }
    }

    /// Machine-readable code, stable across releases (logged and returned
    /// in error payloads).
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Io => "io_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Crypto => "crypto_error",
            ErrorKind::Authentication => "auth_failed",
            ErrorKind::Truncation => "stream_truncated",
            ErrorKind::InvalidRange => "invalid_range",
            ErrorKind::RangeNotSatisfiable => "range_not_satisfiable",
            ErrorKind::MetadataTooLarge => "metadata_too_large",
            ErrorKind::MetadataMalformed => "metadata_malformed",
            ErrorKind::KmsUnavailable => "kms_unavailable",
            ErrorKind::KmsAuth => "kms_auth_failed",
            ErrorKind::KmsNoSuchKey => "kms_no_such_key",
            ErrorKind::KmsDecrypt => "kms_decrypt_failed",
            ErrorKind::Config => "config_error",
        }
    }

    /// Whether upstream may retry the operation verbatim.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Io | ErrorKind::KmsUnavailable)
    }

    /// Recover a `ShroudError` smuggled through `std::io::Error` by a
    /// `Read` adapter. Plain I/O errors come back as `ShroudError::Io`.
    pub fn from_io(err: std::io::Error) -> ShroudError {
        if err.get_ref().is_some_and(|e| e.is::<ShroudError>()) {
            match err.into_inner().map(|b| b.downcast::<ShroudError>()) {
                Some(Ok(inner)) => *inner,
                // is::<ShroudError> held above, so this arm is unreachable,
                // but the type system can't see that.
                Some(Err(other)) => {
                    ShroudError::Io(std::io::Error::new(std::io::ErrorKind::Other, other))
                }
                None => ShroudError::Io(std::io::ErrorKind::Other.into()),
            }
        } else {
            ShroudError::Io(err)
        }
    }
}

impl From<ShroudError> for std::io::Error {
    fn from(err: ShroudError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Io => std::io::ErrorKind::Other,
            ErrorKind::Cancelled => std::io::ErrorKind::Interrupted,
            ErrorKind::Truncation => std::io::ErrorKind::UnexpectedEof,
            ErrorKind::Authentication => std::io::ErrorKind::InvalidData,
            _ => std::io::ErrorKind::Other,
        };
        match err {
            // Unwrap plain I/O errors instead of double-boxing them.
            ShroudError::Io(inner) => inner,
            other => std::io::Error::new(kind, other),
        }
    }
}
