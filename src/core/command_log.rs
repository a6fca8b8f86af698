//! Command log - ordered record of every command sent to the child

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One submitted command and the output captured for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    /// Joined command text, including the trailing blank line
    pub command_text: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Add captured lines. Ignored once the record is complete.
    pub fn append(&mut self, stdout: &[String], stderr: &[String]) {
        if self.is_complete() {
            return;
        }
        extend_lines(&mut self.stdout, stdout);
        extend_lines(&mut self.stderr, stderr);
    }

    /// Mark the record complete. Only the first call has any effect.
    pub fn finish(&mut self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.completed_at = Some(Utc::now());
        true
    }
}

fn extend_lines(text: &mut String, lines: &[String]) {
    for line in lines {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(line);
    }
}

/// Insertion-ordered log; a record's id is its position rendered as a string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandLog {
    records: Vec<CommandRecord>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new open record and return its id
    pub fn push(&mut self, command_text: String) -> String {
        let id = self.records.len().to_string();
        self.records.push(CommandRecord {
            id: id.clone(),
            command_text,
            stdout: String::new(),
            stderr: String::new(),
            submitted_at: Utc::now(),
            completed_at: None,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&CommandRecord> {
        id.parse::<usize>().ok().and_then(|i| self.records.get(i))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut CommandRecord> {
        id.parse::<usize>().ok().and_then(|i| self.records.get_mut(i))
    }

    /// The current command
    pub fn last(&self) -> Option<&CommandRecord> {
        self.records.last()
    }

    pub fn last_id(&self) -> Option<String> {
        self.last().map(|r| r.id.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &CommandRecord> {
        self.records.iter()
    }

    /// Check ids are dense and in order, as loaded from disk
    pub fn is_consistent(&self) -> bool {
        self.records
            .iter()
            .enumerate()
            .all(|(i, r)| r.id == i.to_string())
    }
}

impl fmt::Display for CommandLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "[{}] {}", record.id, record.command_text.trim_end())?;
            if !record.stdout.is_empty() {
                for line in record.stdout.lines() {
                    writeln!(f, "    stdout | {line}")?;
                }
            }
            if !record.stderr.is_empty() {
                for line in record.stderr.lines() {
                    writeln!(f, "    stderr | {line}")?;
                }
            }
        }
        Ok(())
    }
}
