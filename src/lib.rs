//! snowrelay: an HTTP Nostr relay built on `relay-core`.

pub mod config;
pub mod gateway;
pub mod rate_limit;
pub mod relay;

pub use config::Config;
pub use relay::Relay;
