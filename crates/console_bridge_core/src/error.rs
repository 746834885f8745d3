use thiserror::Error;

use crate::probe::ExpectedKind;

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("Transport send failed: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Decode mismatch for '{label}': expected {expected}, got {text:?}")]
    DecodeMismatch {
        label: String,
        expected: ExpectedKind,
        text: String,
    },

    #[error("Unknown result kind: {0}")]
    UnknownKind(String),

    #[error("Invalid alias identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Display sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Invalid config value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsoleError {
    pub fn decode_mismatch(
        label: impl Into<String>,
        expected: ExpectedKind,
        text: impl Into<String>,
    ) -> Self {
        Self::DecodeMismatch {
            label: label.into(),
            expected,
            text: text.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Failure reported by the display sink when it cannot accept a line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("display sink is at capacity")]
    Full,

    #[error("display sink is closed")]
    Closed,
}
