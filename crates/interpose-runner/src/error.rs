use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort an invocation before the child is spawned.
///
/// Everything else (probe failures, unmatched classifications, child crashes,
/// timeouts) degrades to a conservative default or becomes a recorded status.
#[derive(Debug, Error)]
pub enum InterposeError {
    #[error("configuration_missing: {0}")]
    ConfigurationMissing(String),

    #[error("settings_invalid: {path}: {message}")]
    SettingsInvalid { path: PathBuf, message: String },

    #[error("spawn_failed: {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl InterposeError {
    pub fn code(&self) -> &'static str {
        match self {
            InterposeError::ConfigurationMissing(_) => "configuration_missing",
            InterposeError::SettingsInvalid { .. } => "settings_invalid",
            InterposeError::Spawn { .. } => "spawn_failed",
        }
    }
}
