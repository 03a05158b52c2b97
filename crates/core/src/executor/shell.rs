//! Host shell execution strategy.
//!
//! One `bash` child per job. All script fragments are written to its
//! stdin in order, followed by an `env > <dump>` sentinel, and stdin
//! is closed so the interpreter exits on its own. stdout and stderr
//! drain concurrently into the log pipeline while a timeout timer and
//! the job's cancellation token race the child's natural exit.
//!
//! The child is spawned as its own process-group leader and killed as
//! a group: user scripts routinely leave grandchildren (`sleep`,
//! background tails) holding the output pipes, and killing only the
//! interpreter would stall the drain on EOF.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::domain::{
    CmdIn, CmdStatus, ExecutedCmd, LogItem, LogStream, EXIT_CODE_KILLED, EXIT_CODE_TIMEOUT,
    EXIT_CODE_UNKNOWN, VAR_AGENT_JOB_DIR, VAR_AGENT_PLUGIN_DIR,
};
use crate::error::EngineError;

use super::env_dump::parse_env_dump;
use super::log_pipeline::{pump_reader, LogPipeline};
use super::panic_message;
use super::state::JobState;

/// Interpreter running the job scripts.
const SHELL: &str = "bash";

/// Sentinel command ending an interactive session.
pub const EXIT_CMD: &str = "exit";

/// Buffer of the interactive command channel.
const INTERACTIVE_CHANNEL_CAPACITY: usize = 16;

/// How long to wait for the output drain after the child is gone
/// before giving up on stragglers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a supervised child came to an end.
enum Outcome {
    Exited(std::process::ExitStatus),
    WaitFailed(std::io::Error),
    TimedOut,
    Killed,
}

/// Single-shot host-shell executor.
pub struct ShellExecutor {
    cmd: CmdIn,
    job: JobState,
    pipeline: LogPipeline,
    plugin_dir: PathBuf,
    log_dir: PathBuf,
    /// Set when interactive mode is enabled; consumed by `start()`.
    interactive: Mutex<Option<mpsc::Receiver<String>>>,
}

impl ShellExecutor {
    /// Wire up a new executor. No I/O happens here.
    pub fn new(
        parent: CancellationToken,
        cmd: CmdIn,
        plugin_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        let pipeline = LogPipeline::new(&cmd.id);
        let job = JobState::new(&cmd, parent, pipeline.line_counter());
        Self {
            cmd,
            job,
            pipeline,
            plugin_dir: plugin_dir.into(),
            log_dir: log_dir.into(),
            interactive: Mutex::new(None),
        }
    }

    /// Switch the session to interactive mode and return the command
    /// sender. `scripts` is ignored; stdin is driven by the returned
    /// channel until [`EXIT_CMD`] (or channel close) ends the session.
    ///
    /// Must be called before [`start`](Self::start).
    pub fn interactive_channel(&self) -> mpsc::Sender<String> {
        let (tx, rx) = mpsc::channel(INTERACTIVE_CHANNEL_CAPACITY);
        *self
            .interactive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(rx);
        tx
    }

    /// Request cancellation; idempotent and safe from any task.
    pub fn kill(&self) {
        self.job.kill();
    }

    /// Receive end of the log stream. Single consumer; `None` after
    /// the first call.
    pub fn take_log_channel(&self) -> Option<mpsc::Receiver<LogItem>> {
        self.pipeline.take_receiver()
    }

    /// Snapshot of the job record; terminal once `start()` returned.
    pub fn result(&self) -> ExecutedCmd {
        self.job.snapshot()
    }

    /// Drive the job to its terminal status. Blocks until done; job
    /// failures are reported through [`result`](Self::result), not as
    /// an `Err`.
    pub async fn start(&self) -> Result<(), EngineError> {
        if !self.job.try_claim_start() {
            return Err(EngineError::AlreadyStarted(self.cmd.id.clone()));
        }

        if self.job.is_cancelled() {
            self.job.finish(
                CmdStatus::Killed,
                EXIT_CODE_KILLED,
                Some("killed before start".to_string()),
            );
            self.pipeline.close();
            return Ok(());
        }

        // One recovery point: a panic anywhere in the lifecycle
        // becomes an Exception status and teardown still runs.
        if let Err(panic) = std::panic::AssertUnwindSafe(self.execute())
            .catch_unwind()
            .await
        {
            self.job.finish(
                CmdStatus::Exception,
                EXIT_CODE_UNKNOWN,
                Some(panic_message(&panic)),
            );
        }

        self.pipeline.close();
        Ok(())
    }

    async fn execute(&self) {
        let work_dir = match self.cmd.work_dir.as_deref() {
            Some(dir) => PathBuf::from(self.cmd.inputs.expand(dir)),
            None => config::default_workspace(),
        };

        for dir in [&work_dir, &self.log_dir] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                self.fail_exception(format!("cannot create {}: {e}", dir.display()));
                return;
            }
        }

        // Scratch file the sentinel command dumps the environment
        // into; removed when the handle drops.
        let dump_file = match tempfile::Builder::new()
            .prefix(".env-")
            .tempfile_in(&self.log_dir)
        {
            Ok(file) => file,
            Err(e) => {
                self.fail_exception(format!("cannot create env dump file: {e}"));
                return;
            }
        };
        let dump_path = dump_file.path().to_path_buf();

        let mut command = Command::new(SHELL);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&work_dir)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        // Child env: inherited host env, then descriptor inputs, then
        // the agent-injected paths.
        for (key, value) in self.cmd.inputs.iter() {
            command.env(key, value);
        }
        command.env(VAR_AGENT_JOB_DIR, &work_dir);
        command.env(VAR_AGENT_PLUGIN_DIR, &self.plugin_dir);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_exception(format!("cannot spawn {SHELL}: {e}"));
                return;
            }
        };

        let pid = child.id().map(i64::from).unwrap_or(0);
        self.job.mark_running(pid);
        tracing::debug!(cmd_id = %self.cmd.id, pid, "shell child spawned");

        let cancel = self.job.cancel_token();
        let stdin = child.stdin.take();
        let interactive = self
            .interactive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let feeder: JoinHandle<()> = match interactive {
            Some(rx) => tokio::spawn(feed_interactive(
                stdin,
                rx,
                dump_path.clone(),
                cancel.clone(),
            )),
            None => tokio::spawn(feed_scripts(
                stdin,
                self.cmd.scripts.clone(),
                dump_path.clone(),
            )),
        };

        let mut drains = Vec::new();
        if let (Some(stdout), Some(writer)) =
            (child.stdout.take(), self.pipeline.writer(LogStream::Stdout))
        {
            drains.push(tokio::spawn(pump_reader(stdout, writer)));
        }
        if let (Some(stderr), Some(writer)) =
            (child.stderr.take(), self.pipeline.writer(LogStream::Stderr))
        {
            drains.push(tokio::spawn(pump_reader(stderr, writer)));
        }

        let timeout = self.cmd.timeout();
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Killed,
        };

        if matches!(outcome, Outcome::TimedOut | Outcome::Killed) {
            // Unwind everything hanging off the job token, then take
            // the whole process group down.
            self.job.kill();
            #[cfg(unix)]
            kill_process_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        feeder.abort();
        let _ = feeder.await;
        for mut drain in drains {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut drain).await.is_err() {
                drain.abort();
                let _ = drain.await;
            }
        }

        // Best effort: on timeout or kill the dump is usually absent
        // or partial, which parses to an empty map.
        if let Ok(bytes) = tokio::fs::read(&dump_path).await {
            if !bytes.is_empty() {
                self.job
                    .set_output(parse_env_dump(&bytes, &self.cmd.env_filters));
            }
        }

        match outcome {
            Outcome::Exited(status) => match status.code() {
                Some(0) => {
                    self.job.finish(CmdStatus::Success, 0, None);
                }
                Some(code) => {
                    self.job.finish(
                        CmdStatus::Exception,
                        code,
                        Some(format!("exit status {code}")),
                    );
                }
                None => {
                    self.job.finish(
                        CmdStatus::Exception,
                        EXIT_CODE_UNKNOWN,
                        Some("terminated by signal".to_string()),
                    );
                }
            },
            Outcome::WaitFailed(e) => {
                self.fail_exception(format!("wait for child failed: {e}"));
            }
            Outcome::TimedOut => {
                tracing::debug!(cmd_id = %self.cmd.id, "job timed out");
                self.job.finish(
                    CmdStatus::Timeout,
                    EXIT_CODE_TIMEOUT,
                    Some(format!("timed out after {}s", timeout.as_secs())),
                );
            }
            Outcome::Killed => {
                tracing::debug!(cmd_id = %self.cmd.id, "job killed");
                self.job.finish(
                    CmdStatus::Killed,
                    EXIT_CODE_KILLED,
                    Some("killed by cancellation request".to_string()),
                );
            }
        }
        // dump_file drops here and removes the scratch file.
    }

    fn fail_exception(&self, message: String) {
        tracing::warn!(cmd_id = %self.cmd.id, error = %message, "shell job failed");
        self.job
            .finish(CmdStatus::Exception, EXIT_CODE_UNKNOWN, Some(message));
    }
}

/// Stream the script fragments, then the env-dump sentinel, then
/// close stdin.
async fn feed_scripts(stdin: Option<ChildStdin>, scripts: Vec<String>, dump_path: PathBuf) {
    let Some(mut stdin) = stdin else { return };
    for script in &scripts {
        if write_line(&mut stdin, script).await.is_err() {
            return;
        }
    }
    finish_session(&mut stdin, &dump_path).await;
}

/// Interactive variant: stdin is driven by the command channel until
/// the exit sentinel, channel close, or job cancellation.
async fn feed_interactive(
    stdin: Option<ChildStdin>,
    mut commands: mpsc::Receiver<String>,
    dump_path: PathBuf,
    cancel: CancellationToken,
) {
    let Some(mut stdin) = stdin else { return };
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };
        if command == EXIT_CMD {
            break;
        }
        if write_line(&mut stdin, &command).await.is_err() {
            return;
        }
    }
    finish_session(&mut stdin, &dump_path).await;
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Write the env-dump sentinel; dropping stdin afterwards ends the
/// interpreter.
async fn finish_session(stdin: &mut ChildStdin, dump_path: &Path) {
    let sentinel = format!("env > {}\n", dump_path.display());
    let _ = stdin.write_all(sentinel.as_bytes()).await;
    let _ = stdin.flush().await;
}

/// SIGKILL the child's process group. The child was spawned as group
/// leader, so its pgid equals its pid.
#[cfg(unix)]
fn kill_process_group(pid: i64) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if pid <= 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "process group already gone");
    }
}
