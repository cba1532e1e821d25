//! Error types shared by all coordspace crates
//!
//! Component crates define their own error enums (persistence, codec,
//! remoting, query parsing); this one covers what the common crate itself
//! can fail on.

use thiserror::Error;

/// Common result type
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid space URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("config file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
