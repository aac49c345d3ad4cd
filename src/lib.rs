#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod endpoint;
pub mod endpoints {
    pub mod memory;
}
pub mod error;
pub mod events;
pub mod filter;
pub mod message;
pub mod relay;
pub mod router;
pub mod stats;
pub mod supervisor;
pub mod topology;
pub mod tracker;

pub use relay::Relay;
