//! tt-agent: Remote side of a tether session
//!
//! The agent dials a listener over TLS, authenticates, and then serves its
//! commands: shell execution, file transfer, an interactive terminal and
//! tunnel connections. A supervisor reconnects with backoff when the
//! session drops.

pub mod client;
pub mod processor;
pub mod pty;
pub mod shell;
pub mod transfer;
pub mod tunnel;

pub use client::ReverseClient;
pub use tunnel::{connect_with_retry, RetryOutcome};
