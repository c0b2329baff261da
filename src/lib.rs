//! Command-line front end for `sorng-relay`: config loading, logging setup
//! and argument handling. The binary in `main.rs` wires them together.

pub mod cli;
pub mod config;
pub mod logging;
