//! CLI command handlers.

pub mod train;
