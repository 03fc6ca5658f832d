//! `session-out`: drive an audio output session from the command line.
//!
//! Linear PCM renders to a local device through CPAL; the `null` sink runs any
//! format against simulated hardware, which exercises the tunnel buffer
//! exchange without a DSP.

pub mod cli;
pub mod config;
pub mod runtime;

mod device;
mod sink;
