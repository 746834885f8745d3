//! Console Bridge Core
//!
//! Command/reply multiplexer for an interactive debugging console that shares one
//! line-oriented text channel between automated probes and a human operator.
//! Provides the probe envelope, a single-flight request queue, the inbound message
//! dispatcher, cyclic value polling and the session lifecycle machine.

pub mod config;
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod observable;
pub mod poller;
pub mod probe;
pub mod queue;
pub mod session;
pub mod timer;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{ConsoleConfig, ProbeScripts};
pub use console::{Console, ConsoleStatus};
pub use error::{ConsoleError, SinkError};
pub use observable::Observable;
pub use probe::{ExpectedKind, Label, Probe, ProbeValue, ResultSink};
pub use queue::SubmitOutcome;
pub use session::{PeerInfo, SessionEvent, SessionState, Settings};
pub use transport::{DisplayLine, DisplaySink, IncomingMessage, MessageClass, Transport};

/// Result type alias using ConsoleError
pub type Result<T> = std::result::Result<T, ConsoleError>;
