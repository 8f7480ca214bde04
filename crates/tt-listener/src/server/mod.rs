//! TLS server: accept loop, admission and per-connection handling

mod auth;
mod handler;
mod listener;

pub use auth::authenticate;
pub use handler::handle_connection;
pub use listener::Listener;
