//! Process supervisor - spawns, stops and restarts the interactive child

use super::demux::Demultiplexer;
use crate::error::{DriverError, Result};
use crate::events::{DriverEvent, EventStream};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// How long stopped readers get to hit end-of-stream before being aborted
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Live child process and its streams
struct ProcessHandle {
    child: Child,
    stdin: ChildStdin,
    readers: Vec<JoinHandle<()>>,
    pid: Option<u32>,
}

/// Result of [`ProcessSupervisor::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no process
    NotRunning,
    /// The child exited within the grace period
    Exited,
    /// The grace period ran out and the child was killed
    Killed,
}

/// Owns the child process. At most one process exists at a time.
pub struct ProcessSupervisor {
    launch_command: Vec<String>,
    /// Replaces `launch_command` for the next start only
    next_launch: Option<Vec<String>>,
    demux: Demultiplexer,
    events: EventStream,
    process: Option<ProcessHandle>,
    restarts: usize,
}

impl ProcessSupervisor {
    pub fn new(launch_command: Vec<String>, demux: Demultiplexer, events: EventStream) -> Self {
        Self {
            launch_command,
            next_launch: None,
            demux,
            events,
            process: None,
            restarts: 0,
        }
    }

    /// Use `argv` for the next start instead of the configured command
    pub fn set_next_launch(&mut self, argv: Vec<String>) {
        self.next_launch = Some(argv);
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Number of automatic restarts so far
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Spawn the child with piped streams and start both readers
    pub fn start(&mut self) -> Result<()> {
        let pid = self.spawn()?;
        self.events.emit(DriverEvent::ProcessStarted { pid });
        Ok(())
    }

    fn spawn(&mut self) -> Result<Option<u32>> {
        let argv = self
            .next_launch
            .clone()
            .unwrap_or_else(|| self.launch_command.clone());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DriverError::Config("launch command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                program: program.clone(),
                source,
            })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(DriverError::Spawn {
                    program: program.clone(),
                    source: io::Error::new(io::ErrorKind::Other, "child streams were not piped"),
                });
            }
        };

        let pid = child.id();
        let generation = self.demux.begin_generation();
        let readers = self.demux.spawn_readers(stdout, stderr, generation);
        log::info!("Started `{}` (pid {:?})", program, pid);

        self.next_launch = None;
        self.process = Some(ProcessHandle {
            child,
            stdin,
            readers,
            pid,
        });
        Ok(pid)
    }

    /// Ask the child to terminate, force-kill it after `grace_period`.
    ///
    /// Always leaves the supervisor without a process and the completion
    /// signal set, so no waiter stays blocked.
    pub async fn stop(&mut self, grace_period: Duration) -> StopOutcome {
        let Some(handle) = self.process.take() else {
            self.demux.release();
            return StopOutcome::NotRunning;
        };
        let ProcessHandle {
            mut child,
            stdin,
            readers,
            pid,
        } = handle;

        log::info!("Attempting to terminate the process (pid {:?})...", pid);
        drop(stdin);
        if let Err(e) = terminate(&mut child) {
            log::warn!("Failed to send termination request: {}", e);
        }

        let outcome = match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("Process exited with {}", status);
                StopOutcome::Exited
            }
            Ok(Err(e)) => {
                log::warn!("Failed waiting for process: {}. Killing...", e);
                force_kill(&mut child).await;
                StopOutcome::Killed
            }
            Err(_) => {
                log::warn!("Process did not terminate in time. Killing...");
                force_kill(&mut child).await;
                StopOutcome::Killed
            }
        };

        self.demux.release();
        join_readers(readers).await;
        self.events.emit(DriverEvent::ProcessStopped {
            forced: outcome == StopOutcome::Killed,
        });
        log::info!("Process terminated, readers finished");
        outcome
    }

    /// Replace a dead child with a fresh one
    pub async fn restart(&mut self) -> Result<()> {
        if let Some(handle) = self.process.take() {
            let ProcessHandle {
                mut child,
                readers,
                ..
            } = handle;
            force_kill(&mut child).await;
            for reader in readers {
                reader.abort();
            }
        }

        self.restarts += 1;
        let pid = self.spawn()?;
        log::info!("Restarted process (pid {:?}), restart #{}", pid, self.restarts);
        self.events.emit(DriverEvent::ProcessRestarted { pid });
        Ok(())
    }

    /// Whether the current child is gone: reaped, or its stdout closed
    fn has_exited(&mut self) -> bool {
        let Some(handle) = self.process.as_mut() else {
            return false;
        };
        match handle.child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("Process already exited with {}", status);
                true
            }
            Ok(None) => self.demux.stdout_closed(),
            Err(e) => {
                log::warn!("Failed to poll process: {}", e);
                false
            }
        }
    }

    /// Write to the child's input and flush.
    ///
    /// A child that has already exited, or a broken pipe, restarts the child
    /// once and retries; a second failure is returned as
    /// [`DriverError::BrokenPipe`].
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.has_exited() {
            log::warn!("Process has terminated. Restarting...");
            self.restart().await?;
            return self.write_once(bytes).await;
        }
        match self.try_write(bytes).await? {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                log::warn!("Process has terminated. Restarting...");
                self.restart().await?;
                self.write_once(bytes).await
            }
            Err(e) => Err(DriverError::Io(e)),
        }
    }

    /// Write without restarting; any failure is a broken pipe
    pub async fn write_once(&mut self, bytes: &[u8]) -> Result<()> {
        self.try_write(bytes).await?.map_err(DriverError::BrokenPipe)
    }

    async fn try_write(&mut self, bytes: &[u8]) -> Result<io::Result<()>> {
        let handle = self.process.as_mut().ok_or(DriverError::NotRunning)?;
        let written = match handle.stdin.write_all(bytes).await {
            Ok(()) => handle.stdin.flush().await,
            Err(e) => Err(e),
        };
        Ok(written)
    }
}

/// Send a polite termination request
fn terminate(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = libc::pid_t::try_from(pid)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            // SAFETY: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        child.start_kill()
    }
}

async fn force_kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        log::warn!("Failed to kill process: {}", e);
    }
}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for mut reader in readers {
        if tokio::time::timeout(READER_JOIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            log::debug!("Reader still blocked after stop; aborting");
            reader.abort();
        }
    }
}
