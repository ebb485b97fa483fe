mod config;
pub mod metadata;
pub mod migrations;

pub use config::{Config, LoggingConfig, SyncConfig, ZonePolicyKind};
pub use metadata::MetadataStore;

use std::path::PathBuf;

use crate::error::ConfigError;

/// File name of the metadata database inside the data directory.
pub const METADATA_DB_FILE: &str = "metadata.db";

/// Returns the data directory, creating it when missing.
///
/// `RECORDSYNC_HOME` overrides the location outright. Otherwise this is
/// `~/.config/recordsync[-dev]/`, with the `-dev` suffix selected by
/// `RECORDSYNC_ENV=dev`.
///
/// # Errors
/// Returns an error if creating the directory fails.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let dir = match std::env::var_os("RECORDSYNC_HOME") {
        Some(home) => PathBuf::from(home),
        None => {
            let base_dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config");

            let env = std::env::var("RECORDSYNC_ENV").unwrap_or_else(|_| "production".to_string());
            if env == "dev" {
                base_dir.join("recordsync-dev")
            } else {
                base_dir.join("recordsync")
            }
        }
    };

    std::fs::create_dir_all(&dir)
        .map_err(|e| ConfigError::DataDir(format!("{}: {e}", dir.display())))?;
    Ok(dir)
}
