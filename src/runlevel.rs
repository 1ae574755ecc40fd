//! Runlevel executor (C10): rc1/rc2/rc3 sequencing on rank 0, grounded on
//! the `runlevel.c` command-construction and exit-code rules (§4.10).
//!
//! A slot's configured command is zero, one, or more than one argument:
//! zero means "not configured" and succeeds immediately; exactly one is
//! run through `sh -c`, letting the operator write a pipeline or globs;
//! more than one is exec'd directly as argv, no shell involved.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::BrokerError;

/// The three well-known levels, run in order and never skipped backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Rc1 = 1,
    Rc2 = 2,
    Rc3 = 3,
}

/// Commands configured for each runlevel slot. `None` (or an empty
/// argument list) means the slot is not configured.
#[derive(Debug, Clone, Default)]
pub struct RunlevelConfig {
    pub rc1: Option<Vec<String>>,
    pub rc2: Option<Vec<String>>,
    pub rc3: Option<Vec<String>>,
}

impl RunlevelConfig {
    fn slot(&self, level: Level) -> Option<&[String]> {
        match level {
            Level::Rc1 => self.rc1.as_deref(),
            Level::Rc2 => self.rc2.as_deref(),
            Level::Rc3 => self.rc3.as_deref(),
        }
    }
}

/// Rank 0's runlevel state: enforces that levels only advance.
pub struct RunlevelExecutor {
    config: RunlevelConfig,
    current: AtomicU32,
}

impl RunlevelExecutor {
    pub fn new(config: RunlevelConfig) -> Self {
        Self {
            config,
            current: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> u32 {
        self.current.load(Ordering::SeqCst)
    }

    /// Run `level`'s configured command to completion, then advance the
    /// level. Rejects going backward or re-running a level already passed.
    pub async fn run(&self, level: Level) -> Result<i32, BrokerError> {
        let current = self.current.load(Ordering::SeqCst);
        if (level as u32) <= current {
            return Err(BrokerError::Malformed(format!(
                "runlevel {} already reached (currently at {current})",
                level as u32
            )));
        }

        let code = match self.config.slot(level) {
            None => {
                info!(level = level as u32, "runlevel slot not configured, skipping");
                0
            }
            Some(args) if args.is_empty() => {
                info!(level = level as u32, "runlevel slot not configured, skipping");
                0
            }
            Some(args) => run_command(level as u32, args).await?,
        };

        self.current.store(level as u32, Ordering::SeqCst);
        Ok(code)
    }
}

fn build_command(args: &[String]) -> Command {
    if args.len() == 1 {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&args[0]);
        cmd
    } else {
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd
    }
}

async fn run_command(level: u32, args: &[String]) -> Result<i32, BrokerError> {
    let mut cmd = build_command(args);
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    info!(level, command = ?args, "running runlevel command");
    let mut child = cmd
        .spawn()
        .map_err(|e| BrokerError::Config(format!("rc{level}: failed to spawn: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = stdout.map(|s| tokio::spawn(stream_prefixed(level, "stdout", s)));
    let err_task = stderr.map(|s| tokio::spawn(stream_prefixed(level, "stderr", s)));

    let status = child
        .wait()
        .await
        .map_err(|e| BrokerError::Config(format!("rc{level}: wait failed: {e}")))?;

    if let Some(t) = out_task {
        let _ = t.await;
    }
    if let Some(t) = err_task {
        let _ = t.await;
    }

    Ok(exit_code(level, status))
}

async fn stream_prefixed(level: u32, stream: &str, reader: impl tokio::io::AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "runlevel", "rc{level}:{stream}: {line}"),
            Ok(None) => break,
            Err(e) => {
                warn!("rc{level}:{stream}: read error: {e}");
                break;
            }
        }
    }
}

/// A command killed by a signal reports `128 + signal`, matching the
/// shell convention `runlevel.c` follows.
fn exit_code(level: u32, status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                let signal = status.signal().unwrap_or(0);
                error!(level, signal, "runlevel command terminated by signal");
                128 + signal
            }
            #[cfg(not(unix))]
            {
                error!(level, "runlevel command terminated abnormally");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_slot_succeeds_immediately() {
        let exec = RunlevelExecutor::new(RunlevelConfig::default());
        let code = exec.run(Level::Rc1).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(exec.current(), 1);
    }

    #[tokio::test]
    async fn single_arg_runs_through_shell() {
        let cfg = RunlevelConfig {
            rc1: Some(vec!["exit 3".to_string()]),
            ..Default::default()
        };
        let exec = RunlevelExecutor::new(cfg);
        let code = exec.run(Level::Rc1).await.unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn multi_arg_runs_as_argv_without_a_shell() {
        let cfg = RunlevelConfig {
            rc1: Some(vec!["true".to_string(), "ignored".to_string()]),
            ..Default::default()
        };
        let exec = RunlevelExecutor::new(cfg);
        let code = exec.run(Level::Rc1).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn levels_cannot_run_out_of_order() {
        let exec = RunlevelExecutor::new(RunlevelConfig::default());
        exec.run(Level::Rc2).await.unwrap();
        assert!(exec.run(Level::Rc1).await.is_err());
        assert!(exec.run(Level::Rc2).await.is_err());
    }
}
