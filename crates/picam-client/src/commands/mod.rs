//! Subcommand implementations.

pub mod camera;
pub mod config;
