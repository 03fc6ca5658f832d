//! Output session management for a set-top audio HAL.
//!
//! An [`OutputSession`] owns one output stream: its PCM or tunnel handles, the
//! tunnel buffer pool and event thread, an optional software decode stage and
//! an optional A2DP bridge. Hardware is reached only through the traits in
//! [`hw`]; [`sim`] provides an in-memory implementation.

pub mod a2dp;
pub mod config;
pub mod decode;
pub mod decoders;
mod dispatch;
pub mod error;
pub mod event;
pub mod format;
pub mod hw;
pub mod observer;
pub mod params;
pub mod pool;
pub mod queues;
pub mod session;
pub mod sim;
pub mod status;

pub use config::SessionConfig;
pub use error::{DecodeError, HwError, Result, SessionError};
pub use format::{AudioFormat, CodecKind, DeviceMask};
pub use session::{ModeKind, OutputSession, SessionEnv, SessionRequest, SessionState};
pub use status::SessionStatus;
