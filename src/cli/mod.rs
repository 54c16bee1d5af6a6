//! Command-line interface for askbus.
//!
//! Provides the long-running `relay` and `worker` processes plus one-shot
//! `publish` and `dead-letters` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
