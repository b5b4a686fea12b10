//! CLI subcommand implementations for the unlist binary.

pub mod brokers_cmd;
pub mod output;
pub mod scan_cmd;
pub mod start;
pub mod status;
pub mod stop;
