//! Error types and handling
//!
//! This module provides the domain error taxonomy shared by every core
//! component and the built-in modules.

use thiserror::Error;

/// Domain errors for LIMAR
#[derive(Error, Debug)]
pub enum LimarError {
    /// Missing or invalid environment variable or argument
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Late or otherwise invalid module registration
    #[error("Registration error: {message}")]
    Registration { message: String },

    /// Cyclic or missing module/command dependencies
    #[error("Dependency error: {message}")]
    Dependency { message: String },

    /// Manifest parse failure or invariant violation in a context module
    #[error("Manifest error: {message}")]
    Manifest { message: String },

    /// Key not present in the persistent store
    #[error("Key '{key}' not found in store")]
    StoreKeyNotFound { key: String },

    /// Persistent store I/O failure
    #[error("Store error for key '{key}': {source}")]
    StoreIo {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Persistent store encode/decode failure
    #[error("Store error for key '{key}': {message}")]
    StoreCodec { key: String, message: String },

    /// Command string could not be parsed
    #[error("Command parse error: {message}")]
    CommandParse { message: String },

    /// Command execution failure (non-zero exit, transform failure, ...)
    #[error("Command run error: {message}")]
    CommandRun { message: String },

    /// Illegal phase transition or pending subprocess
    #[error("Phase error: {message}")]
    Phase { message: String },

    /// Unknown command ref in a batch
    #[error("Batch error: {message}")]
    Batch { message: String },

    /// A bug in LIMAR or a module, not in user input
    #[error("Internal error: {message}")]
    Internal { message: String },
}

macro_rules! error_ctor {
    ($fn_name:ident, $variant:ident) => {
        pub fn $fn_name(message: impl Into<String>) -> LimarError {
            LimarError::$variant {
                message: message.into(),
            }
        }
    };
}

impl LimarError {
    error_ctor!(config, Config);
    error_ctor!(registration, Registration);
    error_ctor!(dependency, Dependency);
    error_ctor!(manifest, Manifest);
    error_ctor!(command_parse, CommandParse);
    error_ctor!(command_run, CommandRun);
    error_ctor!(phase, Phase);
    error_ctor!(batch, Batch);
    error_ctor!(internal, Internal);

    /// True when the error is the store's key-miss signal rather than a fault
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, LimarError::StoreKeyNotFound { .. })
    }
}

/// Convenience type alias for Results with LimarError
pub type Result<T> = std::result::Result<T, LimarError>;
