/*
 * SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! External process invocation. Every call is an argv vector with a
//! whitelisted environment; output is captured to a log file or returned.

use crate::consts::ENV_WHITELIST;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command '{command}' failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("Command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },
}

impl CallError {
    /// Exit status if the command ran to completion.
    pub fn status(&self) -> Option<i32> {
        match self {
            CallError::Failed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Append stdout and stderr to this file instead of capturing them.
    pub log_file: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub run_as_root: bool,
}

impl CallOptions {
    pub fn with_cwd(mut self, cwd: &Path) -> Self {
        self.cwd = Some(cwd.to_path_buf());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_log_file(mut self, path: &Path) -> Self {
        self.log_file = Some(path.to_path_buf());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn as_root(mut self) -> Self {
        self.run_as_root = true;
        self
    }
}

pub fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn build_command(args: &[String], opts: &CallOptions) -> Vec<String> {
    if opts.run_as_root {
        let mut full = argv(&["sudo", "-n"]);
        full.extend(args.iter().cloned());
        full
    } else {
        args.to_vec()
    }
}

/// Run a command to completion and return its stdout.
pub async fn call(args: &[String], opts: &CallOptions) -> Result<String, CallError> {
    let full = build_command(args, opts);
    let command_line = full.join(" ");
    let Some((program, program_args)) = full.split_first() else {
        return Err(CallError::Spawn {
            command: command_line,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    debug!(command = %command_line, "Calling");

    let mut command = Command::new(program);
    command.args(program_args).env_clear().stdin(Stdio::null());
    for key in ENV_WHITELIST {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    for (key, value) in &opts.env {
        command.env(key, value);
    }
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }

    let spawn_error = |source| CallError::Spawn {
        command: command_line.clone(),
        source,
    };

    if let Some(log_file) = &opts.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(spawn_error)?;
        let file_err = file.try_clone().map_err(spawn_error)?;
        command.stdout(Stdio::from(file)).stderr(Stdio::from(file_err));
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    }

    let child = command.spawn().map_err(spawn_error)?;
    let output: Output = match opts.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(spawn_error)?,
            Err(_) => {
                warn!(command = %command_line, "Command timed out, leaving it running");
                return Err(CallError::Timeout {
                    command: command_line,
                    seconds: timeout.as_secs(),
                });
            }
        },
        None => child.wait_with_output().await.map_err(spawn_error)?,
    };

    if !output.status.success() {
        let stderr = if opts.log_file.is_some() {
            format!("see {}", opts.log_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default())
        } else {
            String::from_utf8_lossy(&output.stderr).trim().to_string()
        };

        return Err(CallError::Failed {
            command: command_line,
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// One step of a reversible command sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceStep {
    pub run: Vec<String>,
    pub undo: Option<Vec<String>>,
}

impl SequenceStep {
    pub fn new(run: Vec<String>, undo: Vec<String>) -> Self {
        Self {
            run,
            undo: Some(undo),
        }
    }

    pub fn run_only(run: Vec<String>) -> Self {
        Self { run, undo: None }
    }
}

async fn rollback(sequence: &[SequenceStep], from: usize, opts: &CallOptions) {
    for step in sequence[..=from].iter().rev() {
        if let Some(undo) = &step.undo {
            if let Err(e) = call(undo, opts).await {
                warn!(error = %e, "Rollback step failed (ignored)");
            }
        }
    }
}

/// Run a sequence of steps. On failure of step `i`, the undo commands of
/// steps `i..=0` run in reverse order and the original error is returned.
/// With `rollback_only`, only the undo commands run (last to first).
pub async fn call_sequence(
    sequence: &[SequenceStep],
    rollback_only: bool,
    opts: &CallOptions,
) -> Result<(), CallError> {
    if sequence.is_empty() {
        return Ok(());
    }

    if rollback_only {
        rollback(sequence, sequence.len() - 1, opts).await;
        return Ok(());
    }

    for (i, step) in sequence.iter().enumerate() {
        if let Err(e) = call(&step.run, opts).await {
            warn!(error = %e, step = i, "Sequence step failed, rolling back");
            rollback(sequence, i, opts).await;
            return Err(e);
        }
    }

    Ok(())
}
