//! CLI command implementations.

pub mod common;
pub mod config;
pub mod drain;
pub mod record;
pub mod status;
