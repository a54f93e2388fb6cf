use thiserror::Error;

/// Stable numeric codes, one per error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    Memory = -1,
    InvalidArgs = -2,
    NotFound = -3,
    Io = -4,
    Corruption = -5,
    Exists = -6,
    Conflict = -7,
    TooLarge = -8,
    MemoryLimit = -9,
    InvalidDb = -10,
    Unknown = -11,
    Locked = -12,
}

impl ErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::Memory => "memory allocation failed",
            ErrorCode::InvalidArgs => "invalid arguments",
            ErrorCode::NotFound => "not found",
            ErrorCode::Io => "I/O error",
            ErrorCode::Corruption => "data corruption",
            ErrorCode::Exists => "already exists",
            ErrorCode::Conflict => "transaction conflict",
            ErrorCode::TooLarge => "key or value too large",
            ErrorCode::MemoryLimit => "memory limit exceeded",
            ErrorCode::InvalidDb => "invalid database handle",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::Locked => "database is locked",
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Memory allocation failed: {0}")]
    Memory(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted data: {0}")]
    Corruption(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Key or value too large: {0}")]
    TooLarge(String),

    #[error("Memory limit exceeded: {0}")]
    MemoryLimit(String),

    #[error("Invalid database handle")]
    InvalidDb,

    #[error("Resource locked: {0}")]
    Locked(String),

    /// Operation on a freed, finished or dropped handle.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::Memory(_) => ErrorCode::Memory,
            StorageError::InvalidArgs(_) | StorageError::InvalidState(_) => ErrorCode::InvalidArgs,
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::Io(_) => ErrorCode::Io,
            StorageError::Corruption(_) => ErrorCode::Corruption,
            StorageError::Exists(_) => ErrorCode::Exists,
            StorageError::Conflict(_) => ErrorCode::Conflict,
            StorageError::TooLarge(_) => ErrorCode::TooLarge,
            StorageError::MemoryLimit(_) => ErrorCode::MemoryLimit,
            StorageError::InvalidDb => ErrorCode::InvalidDb,
            StorageError::Locked(_) => ErrorCode::Locked,
            StorageError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

// Conversion for channel errors
impl<T> From<crossbeam_channel::SendError<T>> for StorageError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        StorageError::Unknown(format!("background channel closed: {}", err))
    }
}

// Conversion for system time errors
impl From<std::time::SystemTimeError> for StorageError {
    fn from(err: std::time::SystemTimeError) -> Self {
        StorageError::Unknown(format!("system time: {}", err))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corruption(format!("manifest: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
