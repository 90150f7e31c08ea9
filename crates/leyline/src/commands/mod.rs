//! Subcommand implementations

pub mod predict;
pub mod review;
pub mod workflow;
