//! Seams to the collaborators outside the core: the outbound channel, the inbound
//! message triples it produces, and the display surface.

use serde::{Deserialize, Serialize};

use crate::error::{ConsoleError, SinkError};

/// Outbound half of the connection.
pub trait Transport {
    fn send(&mut self, text: &str) -> Result<(), ConsoleError>;
}

/// Where forwarded lines are displayed. `Err(SinkError::Full)` asks the dispatcher to
/// back off; the line is retried later, never dropped.
pub trait DisplaySink {
    fn write(&mut self, line: &DisplayLine) -> Result<(), SinkError>;
}

/// How the transport classified an inbound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    /// Free-form log output from the remote process.
    Log,
    /// Error output from the remote process.
    Error,
    /// Echo of a command written to the channel.
    CommandEcho,
    /// Result printed by an evaluated command or probe.
    Result,
}

impl MessageClass {
    pub fn is_command_traffic(self) -> bool {
        matches!(self, MessageClass::CommandEcho | MessageClass::Result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emphasis {
    Bold,
    Italic,
    Underline,
}

/// Byte range of the message text rendered with an emphasis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmphasisSpan {
    pub start: usize,
    pub end: usize,
    pub emphasis: Emphasis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub text: String,
    pub class: MessageClass,
    #[serde(default)]
    pub spans: Vec<EmphasisSpan>,
}

impl IncomingMessage {
    pub fn new(text: impl Into<String>, class: MessageClass) -> Self {
        Self {
            text: text.into(),
            class,
            spans: Vec::new(),
        }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self::new(text, MessageClass::Log)
    }

    pub fn echo(text: impl Into<String>) -> Self {
        Self::new(text, MessageClass::CommandEcho)
    }

    pub fn result(text: impl Into<String>) -> Self {
        Self::new(text, MessageClass::Result)
    }

    pub fn with_spans(mut self, spans: Vec<EmphasisSpan>) -> Self {
        self.spans = spans;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayLine {
    pub text: String,
    pub class: MessageClass,
    pub spans: Vec<EmphasisSpan>,
}

impl From<IncomingMessage> for DisplayLine {
    fn from(message: IncomingMessage) -> Self {
        Self {
            text: message.text,
            class: message.class,
            spans: message.spans,
        }
    }
}
