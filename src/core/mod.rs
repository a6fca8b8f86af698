//! Core engine - process supervision, output demultiplexing, command driving

mod command_log;
mod demux;
mod driver;
mod signal;
mod supervisor;

pub use command_log::{CommandLog, CommandRecord};
pub use demux::{sentinel_for, Demultiplexer, SENTINEL};
pub use driver::{command_text, frame, CommandDriver};
pub use signal::CompletionSignal;
pub use supervisor::{ProcessSupervisor, StopOutcome};
