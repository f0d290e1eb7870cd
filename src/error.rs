// src/error.rs
//! Error handling for the fake-shadow system.
//!
//! Fault paths that occur once per frame (over-request, duplicate request,
//! double-free, eviction) are recovered locally and surfaced through `log`.
//! They never abort the frame and never reach this enum. `Error` covers the
//! fallible edges: construction, teardown, and GPU resource setup.

use thiserror::Error;

/// Main error type. Lightweight, Send + Sync + 'static.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A live coordinator already holds the process guard.
    #[error("a FakeShadow coordinator already exists")]
    CoordinatorExists,

    /// The coordinator was disposed; the operation has no live instance.
    #[error("FakeShadow coordinator is disposed")]
    CoordinatorDisposed,

    /// An actor woke up without its render target bound.
    #[error("caster has no render target bound")]
    MissingTarget,

    /// GPU resource creation failed at feature setup.
    #[error("GPU setup failed: {0}")]
    Gpu(String),

    /// Simple custom message (allocation only on the error path).
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::CoordinatorDisposed)
    }
}

/// Convenient `Result` alias for the whole crate.
pub type Result<T> = std::result::Result<T, Error>;
