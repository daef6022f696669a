//! Stream Configuration Module
//!
//! Per-process configuration loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `CPSENS_CONFIG` environment variable (path to TOML file)
//! 2. `cpsens_stream.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded [`StreamConfig`] is handed to the dispatcher and processing
//! loop at startup; there is no global config instance.

mod stream_config;
pub mod defaults;
pub mod validation;

pub use stream_config::*;
