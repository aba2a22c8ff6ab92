//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads and writes the server's TOML file and
//! turns its `[sharing]` table into runtime [`SharingSettings`].
//!
//! [`SharingSettings`]: crate::infrastructure::registry::SharingSettings

pub mod config;
