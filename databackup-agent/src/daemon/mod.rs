//! Process-level concerns of the CLI.

pub mod shutdown;
