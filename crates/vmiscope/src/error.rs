//! Error types for vmiscope.
//!
//! Initialization failures ([`InitError`]) are kept apart from failures of
//! an established session ([`DriverError`]). A listen timeout is not an
//! error at all: [`Vmi::listen`](crate::Vmi::listen) returns `Ok(None)`.

use std::io;
use thiserror::Error;

use crate::api::BackendId;

/// Errors raised while selecting and initializing a backend.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("no suitable introspection backend available")]
    NoBackendAvailable,

    #[error("no backend registered under id {0}")]
    UnknownBackend(BackendId),

    #[error("backend {backend} rejected init parameters: {reason}")]
    RejectedParameters { backend: String, reason: String },

    #[error("backend {backend} failed to initialize: {source}")]
    BackendFailure {
        backend: String,
        #[source]
        source: DriverError,
    },

    #[error("backend id {0} is already registered")]
    DuplicateBackend(BackendId),
}

impl InitError {
    pub fn rejected(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        InitError::RejectedParameters {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn backend_failure(backend: impl Into<String>, source: DriverError) -> Self {
        InitError::BackendFailure {
            backend: backend.into(),
            source,
        }
    }
}

/// Errors raised by operations on an initialized session.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid or destroyed introspection handle")]
    InvalidHandle,

    #[error("introspection session was torn down")]
    TornDown,

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resume requested but the VM is not paused")]
    NotPaused,

    #[error("guest physical frame {0:#x} is not mapped")]
    FrameNotMapped(u64),

    #[error("malformed trap record: {0}")]
    MalformedTrap(String),

    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl DriverError {
    pub fn backend(msg: impl Into<String>) -> Self {
        DriverError::Backend(msg.into())
    }

    /// The `std::io` kind this failure surfaces as through a memory stream.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            DriverError::FrameNotMapped(_) => io::ErrorKind::NotFound,
            DriverError::InvalidHandle | DriverError::TornDown => io::ErrorKind::BrokenPipe,
            DriverError::Unsupported(_) => io::ErrorKind::Unsupported,
            DriverError::InvalidArgument(_) => io::ErrorKind::InvalidInput,
            DriverError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

impl From<DriverError> for io::Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Io(inner) => inner,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Errors raised while reading or writing JSON documents (init parameters,
/// recordings).
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported format version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}
