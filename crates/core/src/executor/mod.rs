//! Command execution engine.
//!
//! One [`Executor`] drives one job from acceptance to a terminal
//! status. Two strategies share the contract: [`ShellExecutor`] runs
//! the interpreter directly on the host, [`DockerExecutor`] runs it
//! inside a container. Construction is wiring only; all I/O starts
//! with [`Executor::start`].

pub mod docker;
pub mod env_dump;
mod log_pipeline;
pub mod shell;
mod state;

use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::AgentSettings;
use crate::domain::{CmdIn, DockerVolume, ExecutedCmd, LogItem};
use crate::error::EngineError;

pub use docker::DockerExecutor;
pub use shell::{ShellExecutor, EXIT_CMD};

/// A single-shot job runner; shell or container strategy behind one
/// surface.
pub enum Executor {
    Shell(ShellExecutor),
    Docker(DockerExecutor),
}

impl Executor {
    /// Pick the strategy from the descriptor: a `docker` spec selects
    /// the container strategy, otherwise the job runs in a host
    /// shell. No I/O happens here.
    pub fn new(
        parent: CancellationToken,
        cmd: CmdIn,
        plugin_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        if cmd.docker.is_some() {
            Executor::Docker(DockerExecutor::new(parent, cmd, plugin_dir, log_dir))
        } else {
            Executor::Shell(ShellExecutor::new(parent, cmd, plugin_dir, log_dir))
        }
    }

    /// Convenience constructor taking the directories from agent
    /// settings.
    pub fn from_settings(parent: CancellationToken, cmd: CmdIn, settings: &AgentSettings) -> Self {
        Self::new(
            parent,
            cmd,
            settings.plugin_dir.clone(),
            settings.logging_dir.clone(),
        )
    }

    /// Attach agent-level extra volumes. Only meaningful for the
    /// container strategy; a shell executor passes through unchanged.
    pub fn with_volumes(self, volumes: Vec<DockerVolume>) -> Self {
        match self {
            Executor::Docker(docker) => Executor::Docker(docker.with_volumes(volumes)),
            shell => shell,
        }
    }

    /// Run the job to completion. Job failures land in
    /// [`result`](Self::result); an `Err` here means caller misuse.
    pub async fn start(&self) -> Result<(), EngineError> {
        match self {
            Executor::Shell(executor) => executor.start().await,
            Executor::Docker(executor) => executor.start().await,
        }
    }

    /// Request cancellation; idempotent, safe from any task, a no-op
    /// once the job reached a terminal status.
    pub fn kill(&self) {
        match self {
            Executor::Shell(executor) => executor.kill(),
            Executor::Docker(executor) => executor.kill(),
        }
    }

    /// Receive end of the bounded log stream. Closed exactly once,
    /// after the terminal status is written. Single consumer; later
    /// calls return `None`.
    pub fn take_log_channel(&self) -> Option<mpsc::Receiver<LogItem>> {
        match self {
            Executor::Shell(executor) => executor.take_log_channel(),
            Executor::Docker(executor) => executor.take_log_channel(),
        }
    }

    /// Snapshot of the job record: in-progress while running,
    /// terminal after completion.
    pub fn result(&self) -> ExecutedCmd {
        match self {
            Executor::Shell(executor) => executor.result(),
            Executor::Docker(executor) => executor.result(),
        }
    }
}

/// Render a payload caught by the lifecycle recovery point.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("internal panic: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("internal panic: {message}")
    } else {
        "internal panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
