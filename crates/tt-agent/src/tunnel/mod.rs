//! Listener-facing connection management: tunnel relays and reconnects

mod endpoint;
mod reconnect;

pub use endpoint::{TunnelEndpoint, DIAL_TIMEOUT};
pub use reconnect::{connect_with_retry, ExponentialBackoff, RetryOutcome};
