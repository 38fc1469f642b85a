//! Spawner backed by `tokio::process`.
//!
//! Starts a program (by default this binary's `worker` subcommand) with the
//! broker socket path and log level passed through the environment.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use super::{ChildProcess, ExitOutcome, ProcessSpawner, SpawnedProcess};
use crate::config::{LOG_LEVEL_ENV, SOCKET_ENV};

/// Runs an external program as the worker.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    log_level: Option<String>,
}

impl CommandSpawner {
    /// Spawn `program args...` for each worker.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            log_level: None,
        }
    }

    /// Log level handed to workers.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }
}

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn spawn(&self, socket_path: &Path) -> Result<SpawnedProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(SOCKET_ENV, socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(level) = &self.log_level {
            cmd.env(LOG_LEVEL_ENV, level);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn worker: {}", self.program.display()))?;
        let pid = child.id().context("Spawned worker has no pid")?;
        debug!(pid, "Spawned worker process");

        Ok(SpawnedProcess {
            pid,
            child: Box::new(TokioChild(child)),
        })
    }
}

struct TokioChild(Child);

#[async_trait]
impl ChildProcess for TokioChild {
    async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        let status = self.0.wait().await?;
        Ok(status.code().map_or_else(
            || ExitOutcome::Signaled(status.signal().unwrap_or(0)),
            ExitOutcome::Exited,
        ))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }
}
