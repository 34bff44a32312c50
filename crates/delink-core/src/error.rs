//! Error types for delink

// This warning is a false positive from thiserror macro expansion
#![allow(unused_assignments)]

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for delink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for delink
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[help]
        help: String,
    },

    /// The directory to walk does not exist
    #[error("Root directory does not exist: {root}")]
    #[diagnostic(help("Check materialize.root in delink.toml or pass --root"))]
    RootNotFound { root: Utf8PathBuf },

    /// Directory traversal error
    #[error("Walk error: {message}")]
    Walk {
        message: String,
        #[help]
        help: String,
    },

    /// Copy, remove or rename failure while replacing a symlink
    #[error("Materialize error: {message}")]
    Materialize {
        message: String,
        #[help]
        help: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a missing root error
    pub fn root_not_found(root: impl Into<Utf8PathBuf>) -> Self {
        Self::RootNotFound { root: root.into() }
    }

    /// Create a walk error
    pub fn walk(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Walk {
            message: message.into(),
            help: help.into(),
        }
    }

    /// Create a materialize error
    pub fn materialize(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Materialize {
            message: message.into(),
            help: help.into(),
        }
    }
}
