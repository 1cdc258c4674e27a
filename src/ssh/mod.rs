//! SSH front door and per-channel relay.
//!
//! Accepts SSH connections, waits on every session channel for the client to
//! name its project through an `env` request, resolves the backend hosting
//! that project and splices the channel onto a fresh SSH connection to it.
//!
//! [`channel`] defines the transport-neutral channel view the state machine
//! ([`phase`]) and relay engine ([`relay`]) work on; [`downstream`],
//! [`upstream`] and [`requests`] adapt `russh` to it.

pub mod channel;
pub mod downstream;
pub mod phase;
pub mod relay;
pub mod requests;
pub mod server;
pub mod session;
pub mod upstream;

#[cfg(test)]
pub(crate) mod fake;

pub use phase::Router;
pub use server::start_ssh_server;
pub use upstream::SshConnector;
