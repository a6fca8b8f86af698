//! Event streaming for operators and automation
//!
//! JSON-serializable events mirroring what the driver logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Which child stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    /// Prefix used when relaying lines to the operator
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Stdout => "STDOUT: ",
            Self::Stderr => "STDERR: ",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Events emitted by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverEvent {
    /// Child process spawned
    ProcessStarted { pid: Option<u32> },
    /// Child process replaced after its input pipe broke
    ProcessRestarted { pid: Option<u32> },
    /// Child process stopped
    ProcessStopped { forced: bool },
    /// Framed command written to the child
    CommandDispatched { id: String },
    /// Non-sentinel output line
    Output { stream: Stream, line: String },
    /// Record populated
    CommandCompleted { id: String },
}

/// Broadcast-based event stream for multiple consumers
#[derive(Clone)]
pub struct EventStream {
    tx: broadcast::Sender<DriverEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: DriverEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}
