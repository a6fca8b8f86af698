//! Launch configuration - how to start the child and talk to it

use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted by [`render`]
pub const PLACEHOLDER: &str = "{}";

/// Root for default work areas, relative to the current directory
const WORK_ROOT: &str = ".replterm";

const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
const DEFAULT_STDERR_SETTLE_MS: u64 = 200;

const PYTHON_BOOTSTRAP: &str = r#"
import sys
import pickle
import types

sys.ps1 = sys.ps2 = ""

def save_object(filename):
    snapshot = {}
    for name, value in list(globals().items()):
        if name.startswith("__") or name in ("save_object", "load_object"):
            continue
        if isinstance(value, (types.ModuleType, types.FunctionType)):
            continue
        try:
            pickle.dumps(value)
        except Exception:
            continue
        snapshot[name] = value
    with open(filename, "wb") as f:
        pickle.dump(snapshot, f)

def load_object(filename):
    with open(filename, "rb") as f:
        globals().update(pickle.load(f))
"#;

/// Configuration for one interpreter session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Program and arguments that start the interactive child
    pub launch_command: Vec<String>,
    /// Command the child runs to print a literal token, e.g. `echo "{}"`
    pub sentinel_echo_template: String,
    /// Command that dumps runtime state to a path
    #[serde(default)]
    pub dump_template: Option<String>,
    /// Command that loads runtime state from a path
    #[serde(default)]
    pub load_template: Option<String>,
    /// Bootstrap script passed as the final launch argument
    #[serde(default)]
    pub init_code: Option<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub persist_runtime_state: bool,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Quiet window after an early stderr wake before a record is sealed
    #[serde(default = "default_stderr_settle_ms")]
    pub stderr_settle_ms: u64,
}

fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

fn default_stderr_settle_ms() -> u64 {
    DEFAULT_STDERR_SETTLE_MS
}

impl ExecConfig {
    /// Minimal config: a launch command and a sentinel echo template
    pub fn new(launch_command: Vec<String>, sentinel_echo_template: impl Into<String>) -> Self {
        Self {
            launch_command,
            sentinel_echo_template: sentinel_echo_template.into(),
            dump_template: None,
            load_template: None,
            init_code: None,
            work_dir: None,
            persist_runtime_state: false,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            stderr_settle_ms: DEFAULT_STDERR_SETTLE_MS,
        }
    }

    /// Interactive python3 with pickle-based state dump/load helpers
    pub fn python() -> Self {
        Self {
            dump_template: Some("save_object('{}')".to_string()),
            load_template: Some("load_object('{}')".to_string()),
            init_code: Some(PYTHON_BOOTSTRAP.to_string()),
            ..Self::new(
                ["python3", "-i", "-q", "-u", "-c"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                "print(\"{}\")",
            )
        }
    }

    /// Plain bash reading commands from its input pipe
    pub fn bash() -> Self {
        Self::new(vec!["bash".to_string()], "echo \"{}\"")
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "python" | "python3" => Ok(Self::python()),
            "bash" | "sh" => Ok(Self::bash()),
            other => Err(DriverError::Config(format!("unknown preset: {other}"))),
        }
    }

    /// Load config from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ExecConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persist_runtime_state = enabled;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn stderr_settle(&self) -> Duration {
        Duration::from_millis(self.stderr_settle_ms)
    }

    /// Check the config is usable before any process is started
    pub fn validate(&self) -> Result<()> {
        if self.launch_command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(DriverError::Config("launch command is empty".into()));
        }

        check_template("sentinel_echo_template", &self.sentinel_echo_template)?;
        if let Some(t) = &self.dump_template {
            check_template("dump_template", t)?;
        }
        if let Some(t) = &self.load_template {
            check_template("load_template", t)?;
        }

        if self.persist_runtime_state && self.dump_template.is_none() {
            return Err(DriverError::Config(
                "persist_runtime_state requires a dump_template".into(),
            ));
        }

        Ok(())
    }

    /// Full argument vector, with the bootstrap script appended
    pub fn launch_argv(&self) -> Vec<String> {
        let mut argv = self.launch_command.clone();
        if let Some(code) = &self.init_code {
            argv.push(code.clone());
        }
        argv
    }

    /// Argument vector that also runs `directive` once the bootstrap is done
    pub fn launch_argv_with(&self, directive: &str) -> Vec<String> {
        let mut argv = self.launch_command.clone();
        match &self.init_code {
            Some(code) => argv.push(format!("{code}\n{directive}\n")),
            None => argv.push(directive.to_string()),
        }
        argv
    }

    /// Work directory, absolute. Defaults to `.replterm/<program>`.
    pub fn resolved_work_dir(&self) -> Result<PathBuf> {
        let dir = match &self.work_dir {
            Some(dir) => dir.clone(),
            None => {
                let program = self
                    .launch_command
                    .first()
                    .and_then(|p| Path::new(p).file_name())
                    .and_then(|n| n.to_str())
                    .unwrap_or("session");
                Path::new(WORK_ROOT).join(program)
            }
        };

        if dir.is_absolute() {
            Ok(dir)
        } else {
            Ok(std::env::current_dir()?.join(dir))
        }
    }
}

/// Substitute the single placeholder in `template`
pub fn render(template: &str, value: &str) -> String {
    template.replacen(PLACEHOLDER, value, 1)
}

fn check_template(name: &str, template: &str) -> Result<()> {
    let count = template.matches(PLACEHOLDER).count();
    if count != 1 {
        return Err(DriverError::Config(format!(
            "{name} must contain exactly one `{PLACEHOLDER}` placeholder, found {count}"
        )));
    }
    Ok(())
}
