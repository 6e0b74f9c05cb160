//! Configuration module for the AV1 conversion service
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
