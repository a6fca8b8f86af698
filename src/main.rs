//! replterm CLI entry point
//!
//! Reads one command per stdin line, runs it in a persistent interpreter and
//! prints what the interpreter wrote for it.

use anyhow::{Context, Result};
use clap::Parser;
use replterm::{CommandDriver, CommandRecord, DriverError, ExecConfig};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "replterm", version, about = "Drive a persistent REPL one command at a time")]
struct Cli {
    /// Built-in interpreter preset (python, bash)
    #[arg(long, default_value = "bash")]
    preset: String,

    /// YAML launch configuration, overrides --preset
    #[arg(long, conflicts_with = "resume")]
    config: Option<PathBuf>,

    /// Work area for state blobs and the session file
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Dump runtime state after every command and save the session on exit
    #[arg(long)]
    persist: bool,

    /// Resume the session saved in this work area
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Print each record as a JSON line
    #[arg(long)]
    json: bool,
}

fn print_record(record: &CommandRecord, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(record)?);
        return Ok(());
    }
    if !record.stdout.is_empty() {
        println!("{}", record.stdout);
    }
    if !record.stderr.is_empty() {
        eprintln!("{}", record.stderr);
    }
    Ok(())
}

fn build_driver(cli: &Cli) -> Result<CommandDriver> {
    if let Some(dir) = &cli.resume {
        return CommandDriver::resume(dir)
            .with_context(|| format!("failed to resume session from {}", dir.display()));
    }

    let mut config = match &cli.config {
        Some(path) => ExecConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ExecConfig::preset(&cli.preset)?,
    };
    if let Some(dir) = &cli.work_dir {
        config = config.with_work_dir(dir);
    }
    if cli.persist {
        config = config.with_persistence(true);
    }
    Ok(CommandDriver::new(config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    log::info!("replterm v{}", env!("CARGO_PKG_VERSION"));

    let mut driver = build_driver(&cli)?;

    let interrupt = driver.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match driver.submit(&[line]).await {
            Ok(id) => {
                if let Some(record) = driver.record(&id) {
                    print_record(&record, cli.json)?;
                }
            }
            Err(DriverError::Interrupted) => return Err(DriverError::Interrupted.into()),
            Err(e) => {
                driver.shutdown().await?;
                return Err(e.into());
            }
        }
    }

    driver.shutdown().await?;
    Ok(())
}
