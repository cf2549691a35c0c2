//! CLI command implementations.

pub mod bans;
pub mod check;
pub mod run;
pub mod sample_config;
pub mod status;
pub mod unban;
pub mod validate;
