//! replterm - persistent REPL driver
//!
//! Runs a long-lived shell or language interpreter as a command/response
//! channel: each command is framed with a sentinel echo, the child's stdout
//! and stderr are split into per-command records, and the session can be
//! saved and resumed on a fresh process.

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod session;
pub mod work_area;

// Re-exports
pub use config::ExecConfig;
pub use core::{CommandDriver, CommandLog, CommandRecord, CompletionSignal, StopOutcome};
pub use error::{DriverError, Result};
pub use events::{DriverEvent, Stream};
pub use session::{SessionState, SessionStore};
pub use work_area::WorkArea;
