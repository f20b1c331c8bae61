//! Bootstrap module for starting a `tandem` client
//!
//! This module handles configuration discovery, loading and validation.

pub mod config;

pub use config::load_config;
