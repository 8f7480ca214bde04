//! tt-core: Core abstractions and configuration for tether
//!
//! This crate provides shared types, traits, error classification,
//! configuration structures and TLS material used by the listener and the
//! agent.

pub mod config;
pub mod error;
pub mod tls;
pub mod traits;
pub mod types;

pub use error::{ErrorKind, TetherError};
pub use types::{SessionEnd, SessionMode, TunnelKind};
