//! CLI module
//!
//! Command-line interface for the tracker and peer binaries.

pub mod args;
pub mod config;

pub use args::{CliArgs, Role};
pub use config::{Config, TrackerConfig};
