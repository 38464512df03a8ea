#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Client-side session plumbing around the interception core.

pub mod info_file;
mod session;

pub use session::{Session, SessionConfig, SessionError, TransportOpener};
