//! Command implementations for the CLI.

pub mod classify;
pub mod init;
pub mod sync;
pub mod watch;
