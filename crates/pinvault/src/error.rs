//! error types for pinvault
//!
//! one enum per component. the two caller-facing enums (`LeCredError`,
//! `KeyBlobError`) also report an [`ErrorClass`] so daemon code can tell
//! "retry later" apart from "my request was malformed".

use thiserror::Error;

/// coarse classification of failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// storage i/o, sealing backend unavailable. caller may retry.
    Transient,
    /// hash tree or blob authentication mismatch. fatal to that label/blob.
    Integrity,
    /// lockout, pcr mismatch, wrong secret. recoverable by caller action.
    Policy,
    /// invalid label, malformed input, missing output slot.
    Usage,
}

#[derive(Debug, Error)]
pub enum HashTreeError {
    #[error("label {0} is outside the tree")]
    InvalidLabel(u64),

    #[error("label {0} is not provisioned")]
    NotFound(u64),

    #[error("label {0} failed integrity verification")]
    Corrupted(u64),

    #[error("hash tree integrity check failed: {0}")]
    TreeCorrupted(String),

    #[error("hash tree rolled back: root counter {root} behind anti-replay counter {counter}")]
    Rollback { root: u64, counter: u64 },

    #[error("leaf payload of {len} bytes exceeds the {max} byte limit")]
    LeafTooLarge { len: usize, max: usize },

    #[error("invalid tree geometry: {0}")]
    InvalidGeometry(String),

    #[error("anti-replay counter: {0}")]
    Counter(#[from] CounterError),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HashTreeResult<T> = std::result::Result<T, HashTreeError>;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter unavailable: {0}")]
    Unavailable(String),

    #[error("counter overflow")]
    Overflow,

    #[error("counter storage error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SealingError {
    #[error("sealing backend unavailable: {0}")]
    Unavailable(String),

    #[error("sealing backend refused the authorization values")]
    Unauthorized,

    #[error("unknown or already consumed session")]
    InvalidSession,

    #[error("sealed data is malformed")]
    MalformedSealedData,

    #[error("platform state does not satisfy the pcr policy")]
    PcrMismatch,

    #[error("challenge response does not satisfy the policy")]
    Mismatch,
}

pub type SealingResult<T> = std::result::Result<T, SealingError>;

/// errors returned by the low entropy credential manager
#[derive(Debug, Error)]
pub enum LeCredError {
    #[error("no free label in the hash tree")]
    NoFreeLabel,

    #[error("hash tree error: {0}")]
    HashTree(HashTreeError),

    #[error("invalid le secret")]
    InvalidLeSecret,

    #[error("invalid reset secret")]
    InvalidResetSecret,

    #[error("too many attempts")]
    TooManyAttempts,

    #[error("invalid label")]
    InvalidLabel,

    #[error("invalid credential metadata")]
    InvalidMetadata,

    #[error("pcr values do not match the credential policy")]
    PcrNotMatch,

    #[error("invalid delay schedule: {0}")]
    InvalidDelaySchedule(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("sealing backend: {0}")]
    Sealing(SealingError),
}

impl LeCredError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LeCredError::HashTree(HashTreeError::Io(_))
            | LeCredError::HashTree(HashTreeError::Counter(_))
            | LeCredError::Sealing(_)
            | LeCredError::NoFreeLabel => ErrorClass::Transient,
            LeCredError::HashTree(_) | LeCredError::InvalidMetadata => ErrorClass::Integrity,
            LeCredError::InvalidLeSecret
            | LeCredError::InvalidResetSecret
            | LeCredError::TooManyAttempts
            | LeCredError::PcrNotMatch => ErrorClass::Policy,
            LeCredError::InvalidLabel
            | LeCredError::InvalidDelaySchedule(_)
            | LeCredError::InvalidArgument(_) => ErrorClass::Usage,
        }
    }
}

impl From<HashTreeError> for LeCredError {
    fn from(e: HashTreeError) -> Self {
        match e {
            HashTreeError::InvalidLabel(_) | HashTreeError::NotFound(_) => LeCredError::InvalidLabel,
            other => LeCredError::HashTree(other),
        }
    }
}

impl From<SealingError> for LeCredError {
    fn from(e: SealingError) -> Self {
        match e {
            SealingError::Mismatch => LeCredError::InvalidLeSecret,
            SealingError::PcrMismatch => LeCredError::PcrNotMatch,
            SealingError::MalformedSealedData => LeCredError::InvalidMetadata,
            other => LeCredError::Sealing(other),
        }
    }
}

pub type LeCredResult<T> = std::result::Result<T, LeCredError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthSetError {
    #[error("truncated authorization set")]
    Truncated,

    #[error("trailing bytes after authorization set")]
    TrailingBytes,

    #[error("unknown tag type in tag {0:#010x}")]
    UnknownTagType(u32),

    #[error("value does not match the type of tag {0:#010x}")]
    TypeMismatch(u32),

    #[error("authorization set is not in canonical order")]
    NotCanonical,

    #[error("tag {0:#010x} is not repeatable")]
    DuplicateTag(u32),

    #[error("authorization set exceeds limit: {0}")]
    TooLarge(&'static str),
}

pub type AuthSetResult<T> = std::result::Result<T, AuthSetError>;

#[derive(Debug, Error)]
pub enum KeyProviderError {
    #[error("encryption key unavailable: {0}")]
    Unavailable(String),
}

/// errors returned by the key blob codec
#[derive(Debug, Error)]
pub enum KeyBlobError {
    #[error("output parameter is null")]
    OutputParameterNull,

    /// covers wrong key, wrong hidden data, tampering and malformed bytes alike
    #[error("invalid key blob")]
    InvalidKeyBlob,

    #[error("key data serialization failed")]
    SerializationError,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("authorization set: {0}")]
    AuthSet(#[from] AuthSetError),
}

impl KeyBlobError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KeyBlobError::OutputParameterNull
            | KeyBlobError::InvalidArgument(_)
            | KeyBlobError::AuthSet(_) => ErrorClass::Usage,
            KeyBlobError::InvalidKeyBlob => ErrorClass::Integrity,
            KeyBlobError::SerializationError => ErrorClass::Transient,
        }
    }
}

pub type KeyBlobResult<T> = std::result::Result<T, KeyBlobError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
