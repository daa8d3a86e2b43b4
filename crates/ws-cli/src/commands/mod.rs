//! CLI subcommand implementations.

pub mod adjust;
pub mod checkout;
pub mod import;
pub mod incident;
pub mod live;
pub mod report;
pub mod reviews;
pub mod serve;
pub mod status;
pub mod sweep;
pub mod timeline;
pub mod util;
