//! Session persistence - save the command history and launch config so a
//! later run can resume on a fresh process

use crate::config::ExecConfig;
use crate::core::CommandLog;
use crate::error::{DriverError, Result};
use crate::work_area::WorkArea;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Durable part of a driver: configuration plus command history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(flatten)]
    pub config: ExecConfig,
    pub command_log: CommandLog,
    pub saved_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(config: ExecConfig, command_log: CommandLog) -> Self {
        Self {
            config,
            command_log,
            saved_at: Utc::now(),
        }
    }
}

/// Reads and writes `session.json` inside a work area
#[derive(Debug, Clone)]
pub struct SessionStore {
    area: WorkArea,
}

impl SessionStore {
    pub fn new(area: WorkArea) -> Self {
        Self { area }
    }

    /// Store rooted at `work_dir`
    pub fn at(work_dir: &Path) -> Self {
        Self::new(WorkArea::new(work_dir))
    }

    pub fn path(&self) -> PathBuf {
        self.area.session_path()
    }

    pub fn exists(&self) -> bool {
        self.path().is_file()
    }

    /// Save session to disk
    pub fn save(&self, state: &SessionState) -> Result<PathBuf> {
        self.area.mark_ignored()?;

        let path = self.path();
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        log::info!(
            "Saved session with {} commands to {}",
            state.command_log.len(),
            path.display()
        );
        Ok(path)
    }

    /// Load session from disk
    pub fn load(&self) -> Result<SessionState> {
        let path = self.path();
        if !path.is_file() {
            return Err(DriverError::Session(format!(
                "no session found at {}",
                path.display()
            )));
        }

        let content = fs::read_to_string(&path)?;
        let state: SessionState = serde_json::from_str(&content)?;

        if !state.command_log.is_consistent() {
            return Err(DriverError::Session(format!(
                "command ids in {} are not sequential",
                path.display()
            )));
        }
        state.config.validate()?;
        Ok(state)
    }
}
