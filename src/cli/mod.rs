//! Command-line interface.
//!
//! Parsing lives in [`args`]; each subcommand is implemented in its own
//! module under [`commands`].

pub mod args;
pub mod commands;

pub use args::{Cli, Commands};
