//! Worksentry CLI library.
//!
//! This crate provides the CLI interface and the long-running report server
//! for the activity timeline and attendance engine.

mod cli;
pub mod commands;
mod config;
pub mod live;

pub use cli::{AdjustAction, Cli, Commands, IncidentAction};
pub use config::{Config, parse_utc_offset};
