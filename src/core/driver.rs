//! Command driver - the public run loop
//!
//! One command is in flight at a time: `submit` frames the command with the
//! optional state-dump directive and the sentinel echo, writes it to the
//! child, and returns once the demultiplexer reports completion.

use super::command_log::{CommandLog, CommandRecord};
use super::demux::{sentinel_for, Demultiplexer, SENTINEL};
use super::supervisor::{ProcessSupervisor, StopOutcome};
use crate::config::{render, ExecConfig};
use crate::error::{DriverError, Result};
use crate::events::{DriverEvent, EventStream};
use crate::session::{SessionState, SessionStore};
use crate::work_area::WorkArea;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Join fragments into the text sent for one command
pub fn command_text<S: AsRef<str>>(fragments: &[S]) -> String {
    let joined: Vec<&str> = fragments.iter().map(AsRef::as_ref).collect();
    format!("{}\n\n", joined.join(" "))
}

/// Append protocol directives to a command
pub fn frame(text: &str, dump_directive: Option<&str>, sentinel_directive: &str) -> String {
    let mut payload = text.to_string();
    for directive in dump_directive.into_iter().chain(Some(sentinel_directive)) {
        payload.push_str(directive);
        if !directive.ends_with('\n') {
            payload.push('\n');
        }
    }
    payload
}

/// Reject text that would confuse the sentinel protocol
fn check_command(text: &str) -> Result<()> {
    if text.contains(SENTINEL) {
        return Err(DriverError::Malformed(format!(
            "command contains the reserved token {SENTINEL}"
        )));
    }
    if text.contains('\0') {
        return Err(DriverError::Malformed("command contains a NUL byte".into()));
    }
    Ok(())
}

fn lost_after_restart(id: &str) -> DriverError {
    DriverError::BrokenPipe(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("process exited again before command {id} ran"),
    ))
}

/// Drives one interactive child process
pub struct CommandDriver {
    config: ExecConfig,
    area: WorkArea,
    store: SessionStore,
    demux: Demultiplexer,
    supervisor: ProcessSupervisor,
    events: EventStream,
    interrupt: CancellationToken,
    /// Set once a fatal error has stopped the run loop
    halted: Option<String>,
}

impl CommandDriver {
    /// Create a driver. The child is started lazily by the first submit.
    pub fn new(config: ExecConfig) -> Result<Self> {
        Self::with_log(config, CommandLog::new())
    }

    fn with_log(mut config: ExecConfig, log: CommandLog) -> Result<Self> {
        config.validate()?;
        let work_dir = config.resolved_work_dir()?;
        config.work_dir = Some(work_dir.clone());

        let area = WorkArea::new(work_dir);
        let events = EventStream::default();
        let demux = Demultiplexer::new(log, events.clone());
        let supervisor = ProcessSupervisor::new(config.launch_argv(), demux.clone(), events.clone());

        Ok(Self {
            store: SessionStore::new(area.clone()),
            area,
            config,
            demux,
            supervisor,
            events,
            interrupt: CancellationToken::new(),
            halted: None,
        })
    }

    /// Rebuild a driver from the session saved in `work_dir`.
    ///
    /// The next process start also loads the runtime state dumped after the
    /// last command of the restored log, so numbering and interpreter state
    /// continue where the saved session stopped.
    pub fn resume(work_dir: &Path) -> Result<Self> {
        let state = SessionStore::at(work_dir).load()?;
        let mut config = state.config;
        config.work_dir = Some(work_dir.to_path_buf());

        let mut driver = Self::with_log(config, state.command_log)?;
        log::info!(
            "Resuming session from {} ({} commands)",
            driver.area.root().display(),
            driver.demux.log_len()
        );

        if let Some(directive) = driver.resume_directive() {
            let argv = driver.config.launch_argv_with(&directive);
            driver.supervisor.set_next_launch(argv);
        }
        Ok(driver)
    }

    /// Load directive for the most recent dumped state, if any
    fn resume_directive(&self) -> Option<String> {
        let template = self.config.load_template.as_ref()?;
        let log = self.demux.log();
        let last = log.last_id()?;

        let id = if self.area.has_blob(&last) {
            last
        } else {
            let fallback = self.area.latest_blob(&log);
            match &fallback {
                Some(id) => log::warn!(
                    "No runtime state for command {}; loading state of command {}",
                    last,
                    id
                ),
                None => log::warn!("No runtime state found; resuming without it"),
            }
            fallback?
        };

        let path = self.area.blob_path(&id);
        Some(render(template, &path.to_string_lossy()))
    }

    /// Submit one command and wait for it to complete. Returns its id.
    pub async fn submit<S: AsRef<str>>(&mut self, fragments: &[S]) -> Result<String> {
        if let Some(reason) = &self.halted {
            return Err(DriverError::Halted(reason.clone()));
        }

        let text = command_text(fragments);
        if let Err(e) = check_command(&text) {
            return Err(self.halt(e));
        }

        if !self.supervisor.is_running() {
            self.supervisor.start()?;
        }

        self.demux.signal().clear();
        let id = self.demux.open(text.clone());

        let payload = match self.framed(&id, &text) {
            Ok(payload) => payload,
            Err(e) => {
                self.demux.seal(&id);
                return Err(self.halt(e));
            }
        };

        log::info!("Sending command {}: {}", id, payload.trim());
        self.events.emit(DriverEvent::CommandDispatched { id: id.clone() });

        let interrupt = self.interrupt.clone();
        let outcome = tokio::select! {
            biased;
            _ = interrupt.cancelled() => None,
            result = self.dispatch(&id, &payload) => Some(result),
        };

        match outcome {
            Some(Ok(())) => Ok(id),
            Some(Err(e)) => {
                self.demux.seal(&id);
                Err(self.halt(e))
            }
            None => {
                log::warn!("Received interrupt. Terminating...");
                if let Err(e) = self.shutdown().await {
                    log::warn!("Shutdown after interrupt failed: {}", e);
                }
                Err(self.halt(DriverError::Interrupted))
            }
        }
    }

    fn framed(&self, id: &str, text: &str) -> Result<String> {
        let dump = match (&self.config.dump_template, self.config.persist_runtime_state) {
            (Some(template), true) => {
                self.area.reserve(id)?;
                let path = self.area.blob_path(id);
                Some(render(template, &path.to_string_lossy()))
            }
            _ => None,
        };
        let sentinel = render(&self.config.sentinel_echo_template, &sentinel_for(id));
        Ok(frame(text, dump.as_deref(), &sentinel))
    }

    /// Write the payload and wait for it.
    ///
    /// If the process dies before the command prints anything, the child is
    /// restarted and the payload resent, sharing the single restart the
    /// supervisor allows per write.
    async fn dispatch(&mut self, id: &str, payload: &str) -> Result<()> {
        let restarts = self.supervisor.restarts();
        self.supervisor.write(payload.as_bytes()).await?;
        self.await_completion(id).await;
        if !self.demux.is_lost(id) {
            return Ok(());
        }
        if self.supervisor.restarts() > restarts {
            return Err(lost_after_restart(id));
        }

        log::warn!("Process exited before command {} ran. Restarting...", id);
        self.supervisor.restart().await?;
        self.supervisor.write_once(payload.as_bytes()).await?;
        self.await_completion(id).await;
        if self.demux.is_lost(id) {
            return Err(lost_after_restart(id));
        }
        Ok(())
    }

    /// Block until `id` finishes or settles.
    ///
    /// A stderr line sets the signal before the sentinel; in that case keep
    /// collecting until the sentinel arrives or output stays quiet for the
    /// settle window. A settled record stays open, and its sentinel (or a
    /// later one) still completes it with the remaining output. Late stderr
    /// from an earlier command can settle a silent one early in the same way.
    async fn await_completion(&self, id: &str) {
        self.demux.signal().wait().await;
        let Some(mut seen) = self.demux.pending(id) else {
            return;
        };

        log::debug!("Command {} woke on stderr; waiting for output to settle", id);
        let settle = self.config.stderr_settle();
        loop {
            tokio::time::sleep(settle).await;
            match self.demux.pending(id) {
                None => return,
                Some(activity) if activity == seen => {
                    self.demux.settle(id);
                    return;
                }
                Some(activity) => seen = activity,
            }
        }
    }

    fn halt(&mut self, err: DriverError) -> DriverError {
        log::error!("Run loop stopped: {}", err);
        self.halted = Some(err.to_string());
        err
    }

    /// Ask the child to load the state dumped after command `id`.
    ///
    /// Goes through the normal submit path and is logged as its own record.
    pub async fn load_runtime_state(&mut self, id: &str) -> Result<String> {
        if !self.supervisor.is_running() {
            return Err(DriverError::NotRunning);
        }
        let template = self
            .config
            .load_template
            .clone()
            .ok_or_else(|| DriverError::Config("no load_template configured".into()))?;

        let path = self.area.blob_path(id);
        if !path.is_file() {
            return Err(DriverError::Session(format!(
                "no runtime state for command {id} at {}",
                path.display()
            )));
        }
        let directive = render(&template, &path.to_string_lossy());
        self.submit(&[directive]).await
    }

    /// Consume command batches until the channel closes or a command fails
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Vec<String>>) -> Result<()> {
        while let Some(fragments) = commands.recv().await {
            self.submit(&fragments[..]).await?;
        }
        Ok(())
    }

    /// Stop the child and persist the session when enabled. Safe to repeat.
    pub async fn shutdown(&mut self) -> Result<StopOutcome> {
        let outcome = self.supervisor.stop(self.config.grace_period()).await;
        if self.config.persist_runtime_state && self.demux.log_len() > 0 {
            self.save_session()?;
        }
        Ok(outcome)
    }

    /// Write the session file now
    pub fn save_session(&self) -> Result<PathBuf> {
        let state = SessionState::new(self.config.clone(), self.demux.log());
        self.store.save(&state)
    }

    /// Remove the work area and everything in it
    pub fn purge_work_area(&self) -> Result<()> {
        self.area.purge()
    }

    pub fn log(&self) -> CommandLog {
        self.demux.log()
    }

    pub fn record(&self, id: &str) -> Option<CommandRecord> {
        self.demux.record(id)
    }

    pub fn last_record(&self) -> Option<CommandRecord> {
        self.demux.log().last().cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    /// Token that interrupts the in-flight submit when cancelled
    pub fn interrupt_handle(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    pub fn restarts(&self) -> usize {
        self.supervisor.restarts()
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn work_area(&self) -> &WorkArea {
        &self.area
    }
}
