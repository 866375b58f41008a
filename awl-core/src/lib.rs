#![forbid(unsafe_code)]

//! Core utilities for Awl.
//!
//! This crate intentionally stays lightweight and pure Rust.
//! Public modules export the peer role and session token types,
//! basic error handling, and the session configuration used by
//! the transport crate.

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::PuncherConfig;
pub use error::{Error, Result};
pub use types::{PeerRole, SessionToken, MAX_TOKEN_LEN};
