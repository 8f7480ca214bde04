//! tt-listener: Accepts tether agents over TLS and drives their sessions
//!
//! The listener authenticates each agent, keeps one session per peer
//! address, multiplexes commands, terminal traffic and tunnel frames over
//! the session's single TLS stream, and exposes an operator console.

pub mod console;
pub mod server;
pub mod session;
pub mod state;
pub mod transfer;
pub mod tunnel;

#[cfg(test)]
mod mock;

pub use server::Listener;
pub use session::SessionRegistry;
pub use state::ListenerState;
