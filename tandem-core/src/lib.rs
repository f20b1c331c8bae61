//! Shared building blocks for `tandem` clients: configuration, logging,
//! identifiers, chat model and the signaling wire protocol.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod protocol;

pub use config::Config;
pub use error::{Error, MalformedEnvelope, Result};
