//! Core trait definitions

mod channel;
mod client;

pub use channel::CommandChannel;
pub use client::SessionClient;
