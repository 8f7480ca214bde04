//! Session management

mod handle;
mod multiplexer;
mod registry;

pub use handle::{Outbound, PtyEvent, SessionChannels, SessionHandle};
pub use multiplexer::{run, MultiplexerConfig};
pub use registry::SessionRegistry;
