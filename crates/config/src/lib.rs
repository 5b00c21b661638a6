//! Provider configuration for the Tether MCP bridge and hub.
//!
//! The config file is a JSON document of the shape
//! `{ "mcpServers": { "<name>": { ... }, ... } }`. Environment variables in
//! the form `${VAR}` or `$VAR` are expanded on the raw text before parsing.
//! A missing file is equivalent to an empty servers map.

mod launch;
mod provider;

pub use launch::{LaunchPlan, spawn_provider};
pub use provider::{
    ProviderConfig, ProviderKind, ProviderSpec, config_mtime, expand_env, load_config,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider is marked `disabled` in the config file. The supervisor
    /// treats this as "do not run", not as a retryable failure.
    #[error("provider '{0}' is disabled")]
    Disabled(String),

    #[error("provider '{name}' has unknown kind '{kind}'")]
    UnknownKind { name: String, kind: String },

    #[error("provider '{name}' ({kind}) is missing '{field}'")]
    MissingField {
        name: String,
        kind: String,
        field: &'static str,
    },
}
