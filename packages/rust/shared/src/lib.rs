//! Shared types, error model, and configuration for ctirelay.
//!
//! This crate is the foundation depended on by all other ctirelay crates.
//! It provides:
//! - [`CtiRelayError`] — the unified error type
//! - Domain types ([`RawRecord`], [`ClientId`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ConnectorConfig, GraphConfig, IdentityConfig, MAX_CONFIDENCE, QueueConfig,
    SinkConfig, SinkKind, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from,
};
pub use error::{CtiRelayError, Result};
pub use types::{ClientId, RawRecord, parse_records};
