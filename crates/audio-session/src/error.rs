//! Error types shared by the session, hardware and decoder layers.

use thiserror::Error;

/// Errors reported by a hardware driver or an open PCM handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HwError {
    /// The stream fell into a state the driver cannot recover by itself.
    ///
    /// Callers recover by closing and reopening the handle once.
    #[error("device in bad state")]
    BadState,

    /// The handle has already been closed.
    #[error("device handle closed")]
    Closed,

    /// The driver does not support the requested use case or parameters.
    #[error("unsupported by device: {0}")]
    Unsupported(String),

    /// Any other negative driver result.
    #[error("driver call failed with code {0}")]
    Failed(i32),
}

/// Errors reported by a decode capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no decoder available for {0}")]
    Unavailable(String),

    #[error("decoder configuration rejected: {0}")]
    Config(String),
}

/// Errors surfaced by [`crate::session::OutputSession`] entry points.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Open-time validation failure; the session was never usable.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    /// Requested format is not handled by any write strategy.
    #[error("unsupported format {0:?}")]
    UnsupportedFormat(crate::format::AudioFormat),

    /// Operation needs a hardware handle that is not open.
    #[error("no hardware handle open for {0}")]
    NoDevice(&'static str),

    /// Operation is not valid for the current session mode or state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Session was stopped; a new session must be opened.
    #[error("session stopped")]
    Stopped,

    /// Hardware failure propagated to the caller.
    #[error("hardware error: {0}")]
    Hardware(#[from] HwError),

    /// Decoder setup or configuration failure.
    #[error("decoder error: {0}")]
    Decode(#[from] DecodeError),

    /// A session thread could not be spawned.
    #[error("thread spawn failed: {0}")]
    Thread(#[from] std::io::Error),
}

/// Convenience result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
