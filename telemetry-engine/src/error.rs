use serde::{Deserialize, Serialize};

use crate::domain::WindowSize;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid reading: {0}")]
    InvalidReading(String),
    #[error("unknown meter: {0}")]
    UnknownMeter(String),
    #[error("index inconsistency in {window} buckets: {detail}")]
    IndexInconsistency { window: WindowSize, detail: String },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("window size {0} is not maintained by the index")]
    UnsupportedWindow(WindowSize),
    #[error("operation cancelled")]
    Cancelled,
    #[error("meter registry error: {0}")]
    Registry(String),
}

/// Per-item failure classification reported back to collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidReading,
    UnknownMeter,
    IndexInconsistency,
    StorageUnavailable,
    UnsupportedWindow,
    Cancelled,
    Registry,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidReading => "invalid_reading",
            Self::UnknownMeter => "unknown_meter",
            Self::IndexInconsistency => "index_inconsistency",
            Self::StorageUnavailable => "storage_unavailable",
            Self::UnsupportedWindow => "unsupported_window",
            Self::Cancelled => "cancelled",
            Self::Registry => "registry",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReading(_) => ErrorKind::InvalidReading,
            Self::UnknownMeter(_) => ErrorKind::UnknownMeter,
            Self::IndexInconsistency { .. } => ErrorKind::IndexInconsistency,
            Self::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            Self::UnsupportedWindow(_) => ErrorKind::UnsupportedWindow,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Registry(_) => ErrorKind::Registry,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
