//! The single logical session to the remote service.
pub mod backoff;
pub mod client;
pub mod maintenance;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{CooldownUnban, ManualUnban, UnbanPolicy};
pub use client::SessionClient;
pub use state::SessionState;
pub use transport::{Transport, UdpTransport};
