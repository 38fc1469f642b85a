//! Worker process creation.
//!
//! The pool never touches `std::process` directly; it goes through a
//! [`ProcessSpawner`], so tests can stand in their own processes.

mod command;

pub use command::CommandSpawner;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with this status code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(i32),
}

impl ExitOutcome {
    /// Whether a signal ended the process.
    pub const fn is_signal(self) -> bool {
        matches!(self, Self::Signaled(_))
    }
}

/// Handle on a running worker process.
#[async_trait]
pub trait ChildProcess: Send {
    /// Wait for the process to end.
    async fn wait(&mut self) -> std::io::Result<ExitOutcome>;

    /// Terminate the process immediately.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly started worker.
pub struct SpawnedProcess {
    pub pid: u32,
    /// Handle used to wait for and kill the process.
    pub child: Box<dyn ChildProcess>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Starts worker processes that connect back to the broker.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    /// Start one worker told to connect to `socket_path`.
    ///
    /// Returns once the OS process exists; registration happens later over
    /// the socket.
    async fn spawn(&self, socket_path: &Path) -> Result<SpawnedProcess>;
}
