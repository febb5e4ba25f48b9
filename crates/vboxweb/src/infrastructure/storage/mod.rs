//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration file from the
//! platform-appropriate directory (or an explicit path), fills in defaults
//! for anything missing, and writes a starter file for `vboxweb config init`.

pub mod config;
