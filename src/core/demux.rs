//! Stream demultiplexer - splits the child's output into per-command records
//!
//! Each framed command ends with an instruction for the child to echo
//! `END_OF_EXECUTION:<id>` on stdout. Lines read before that marker belong to
//! command `<id>`. A non-empty stderr line wakes the issuer early, since an
//! error in the child often means the marker is never printed.

use super::command_log::{CommandLog, CommandRecord};
use super::signal::CompletionSignal;
use crate::events::{DriverEvent, EventStream, Stream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Reserved completion token
pub const SENTINEL: &str = "END_OF_EXECUTION";

/// Sentinel text echoed after command `id`
pub fn sentinel_for(id: &str) -> String {
    format!("{SENTINEL}:{id}")
}

/// Id carried by a sentinel line, if any
fn sentinel_id(rest: &str) -> Option<String> {
    let digits: String = rest
        .strip_prefix(':')?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (!digits.is_empty()).then_some(digits)
}

#[derive(Default)]
struct Capture {
    log: CommandLog,
    /// Commands still waiting for their sentinel, oldest first
    open: Vec<String>,
    /// Output not yet attributed to a record
    stdout: Vec<String>,
    stderr: Vec<String>,
    /// Process generation whose readers may write here
    generation: u64,
    /// Stdout of the current generation reached end-of-stream
    closed: bool,
    /// In-flight command whose process died before it printed anything
    lost: Option<String>,
    /// Count of lines routed, for settle detection
    activity: u64,
}

impl Capture {
    /// Move unattributed output into record `id`
    fn attribute(&mut self, id: &str) {
        let stdout = std::mem::take(&mut self.stdout);
        let stderr = std::mem::take(&mut self.stderr);
        if let Some(record) = self.log.get_mut(id) {
            record.append(&stdout, &stderr);
        }
    }

    /// Complete `ids` with what they already hold
    fn finish(&mut self, ids: Vec<String>) -> Vec<String> {
        if self.lost.as_ref().is_some_and(|lost| ids.contains(lost)) {
            self.lost = None;
        }
        ids.into_iter()
            .filter(|id| self.log.get_mut(id).is_some_and(CommandRecord::finish))
            .collect()
    }

    /// Complete open records up to `id`; pending output belongs to `id`.
    ///
    /// The child runs commands in order, so anything still open with a lower
    /// id will never see its own sentinel.
    fn finish_through(&mut self, id: &str) -> Vec<String> {
        let Some(pos) = self.open.iter().position(|open| open == id) else {
            return Vec::new();
        };
        self.attribute(id);
        let done = self.open.drain(..=pos).collect();
        self.finish(done)
    }

    /// Complete every open record except the newest
    fn finish_older(&mut self) -> Vec<String> {
        let keep = self.open.len().saturating_sub(1);
        let older = self.open.drain(..keep).collect();
        self.finish(older)
    }

    fn finish_all(&mut self) -> Vec<String> {
        match self.open.last().cloned() {
            Some(newest) => self.finish_through(&newest),
            None => {
                self.stdout.clear();
                self.stderr.clear();
                Vec::new()
            }
        }
    }

    fn is_untouched(&self, id: &str) -> bool {
        self.stdout.is_empty()
            && self.stderr.is_empty()
            && self
                .log
                .get(id)
                .is_some_and(|r| r.stdout.is_empty() && r.stderr.is_empty())
    }
}

/// Routes child output into the command log and raises the completion signal
#[derive(Clone)]
pub struct Demultiplexer {
    capture: Arc<Mutex<Capture>>,
    signal: CompletionSignal,
    events: EventStream,
}

impl Demultiplexer {
    pub fn new(log: CommandLog, events: EventStream) -> Self {
        Self {
            capture: Arc::new(Mutex::new(Capture {
                log,
                ..Capture::default()
            })),
            signal: CompletionSignal::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Capture> {
        self.capture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    fn completed(&self, ids: Vec<String>) {
        for id in ids {
            self.events.emit(DriverEvent::CommandCompleted { id });
        }
    }

    /// Open a record for `command` and make it the newest output target.
    ///
    /// Earlier records that settled without a sentinel stay open until a
    /// sentinel at or after them arrives.
    pub fn open(&self, command: String) -> String {
        let mut capture = self.lock();
        let id = capture.log.push(command);
        capture.open.push(id.clone());
        id
    }

    /// Activity counter if `id` is still waiting for its sentinel
    pub fn pending(&self, id: &str) -> Option<u64> {
        let capture = self.lock();
        let waiting = capture.open.iter().any(|open| open == id)
            && capture.lost.as_deref() != Some(id);
        waiting.then_some(capture.activity)
    }

    /// Whether the process running `id` died before `id` produced output
    pub fn is_lost(&self, id: &str) -> bool {
        self.lock().lost.as_deref() == Some(id)
    }

    /// Whether the current process has closed its stdout
    pub fn stdout_closed(&self) -> bool {
        self.lock().closed
    }

    /// Publish what `id` has captured so far, leaving it open for its sentinel
    pub fn settle(&self, id: &str) -> bool {
        let mut capture = self.lock();
        if !capture.open.iter().any(|open| open == id) {
            return false;
        }
        capture.attribute(id);
        log::debug!("Command {} settled before its sentinel", id);
        true
    }

    /// Finalize `id` with whatever has been captured so far
    pub fn seal(&self, id: &str) -> bool {
        let sealed = self.lock().finish_through(id);
        let found = sealed.iter().any(|s| s == id);
        if found {
            log::debug!("Command {} sealed without sentinel", id);
        }
        self.completed(sealed);
        found
    }

    /// Start routing for a new process; older readers become inert.
    ///
    /// Only the newest open command survives, since a fresh process will
    /// never print the sentinels of earlier ones.
    pub fn begin_generation(&self) -> u64 {
        let (generation, sealed) = {
            let mut capture = self.lock();
            capture.generation += 1;
            capture.stdout.clear();
            capture.stderr.clear();
            capture.closed = false;
            capture.lost = None;
            (capture.generation, capture.finish_older())
        };
        self.completed(sealed);
        self.signal.clear();
        generation
    }

    /// Seal every open record, detach readers and wake the issuer
    pub fn release(&self) {
        let sealed = {
            let mut capture = self.lock();
            capture.generation += 1;
            capture.finish_all()
        };
        self.completed(sealed);
        self.signal.set();
    }

    pub fn record(&self, id: &str) -> Option<CommandRecord> {
        self.lock().log.get(id).cloned()
    }

    /// Snapshot of the whole log
    pub fn log(&self) -> CommandLog {
        self.lock().log.clone()
    }

    pub fn log_len(&self) -> usize {
        self.lock().log.len()
    }

    /// Spawn the stdout and stderr readers for one process generation
    pub fn spawn_readers<O, E>(&self, stdout: O, stderr: E, generation: u64) -> Vec<JoinHandle<()>>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        vec![
            tokio::spawn(self.clone().drain(stdout, Stream::Stdout, generation)),
            tokio::spawn(self.clone().drain(stderr, Stream::Stderr, generation)),
        ]
    }

    /// Read lines from one pipe until end-of-stream
    async fn drain<R>(self, pipe: R, stream: Stream, generation: u64)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.handle_line(stream, &line, generation);
                }
                Err(e) => {
                    log::warn!("{} reader error: {}", stream, e);
                    break;
                }
            }
        }

        log::debug!("{} reader reached end of stream", stream);
        self.handle_eof(stream, generation);
    }

    /// Route one raw line
    pub fn handle_line(&self, stream: Stream, raw: &str, generation: u64) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }

        let mut capture = self.lock();
        if capture.generation != generation {
            return;
        }
        capture.activity += 1;

        match stream {
            Stream::Stdout => {
                let Some(pos) = line.find(SENTINEL) else {
                    capture.stdout.push(line.to_string());
                    drop(capture);
                    self.relay(stream, line);
                    return;
                };

                let before = line[..pos].trim();
                if !before.is_empty() {
                    capture.stdout.push(before.to_string());
                    self.relay(stream, before);
                }

                let target = sentinel_id(&line[pos + SENTINEL.len()..])
                    .or_else(|| capture.open.first().cloned())
                    .filter(|id| capture.open.contains(id));
                match target {
                    Some(id) => {
                        let finished = capture.finish_through(&id);
                        let idle = capture.open.is_empty();
                        drop(capture);
                        self.completed(finished);
                        // Older commands finishing late must not wake the
                        // issuer of a newer one.
                        if idle {
                            self.signal.set();
                        }
                    }
                    None => {
                        // Output of a command that was already sealed.
                        log::debug!("Discarding output before stale sentinel");
                        capture.stdout.clear();
                        capture.stderr.clear();
                    }
                }
            }
            Stream::Stderr => {
                capture.stderr.push(line.to_string());
                drop(capture);
                self.relay(stream, line);
                // Errors often suppress the sentinel, so wake the issuer now.
                self.signal.set();
            }
        }
    }

    /// A pipe closed. Stdout closing means no sentinel can arrive.
    ///
    /// If the newest command has produced nothing it is marked lost rather
    /// than sealed, so the driver can resend it to a fresh process.
    pub fn handle_eof(&self, stream: Stream, generation: u64) {
        if stream != Stream::Stdout {
            return;
        }
        let (sealed, lost) = {
            let mut capture = self.lock();
            if capture.generation != generation {
                return;
            }
            capture.closed = true;
            match capture.open.last().cloned() {
                Some(newest) if capture.is_untouched(&newest) => {
                    capture.lost = Some(newest.clone());
                    (capture.finish_older(), Some(newest))
                }
                _ => (capture.finish_all(), None),
            }
        };
        match &lost {
            Some(id) => log::warn!("Child output closed before command {} ran", id),
            None if !sealed.is_empty() => {
                log::warn!("Child output closed while commands {:?} were running", sealed)
            }
            None => {}
        }
        self.completed(sealed);
        self.signal.set();
    }

    fn relay(&self, stream: Stream, line: &str) {
        log::info!("{}{}", stream.prefix(), line);
        self.events.emit(DriverEvent::Output {
            stream,
            line: line.to_string(),
        });
    }
}
