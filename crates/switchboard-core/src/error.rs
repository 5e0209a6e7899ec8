//! Error taxonomy shared across switchboard crates

use thiserror::Error;

/// Errors produced by the coordination layer.
///
/// `Parse` and `Handler` errors are logged where they happen and recorded as
/// the last error of the component that saw them rather than returned.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Channel unreachable, refused, or closed underneath us
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed inbound payload
    #[error("parse error: {0}")]
    Parse(String),

    /// A registered command handler failed or panicked
    #[error("handler '{action}' failed: {message}")]
    Handler { action: String, message: String },

    /// The reconnect budget of a progress stream is spent
    #[error("reconnect attempts exhausted after {attempts} retries: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Writing the shared tenant context record failed
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Invalid configuration or argument
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn handler(action: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Handler {
            action: action.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
