//! Container execution strategy.
//!
//! Talks to the local Docker daemon through [`bollard`]. Each job gets
//! a persistent named volume `flow-<flowId>` mounted at its workspace,
//! a container created from (or resumed into) the descriptor's image,
//! and an exec session running the interpreter the same way the host
//! strategy drives its child: scripts in, log lines out, env dump
//! last.
//!
//! Cancellation and timeout race the lifecycle future; once either
//! wins, cleanup (stop/remove per descriptor policy) runs on fresh
//! client calls that are not bound to the cancelled job token.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogOutput, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding, PortMap};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use bollard::Docker;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    CmdIn, CmdStatus, DockerVolume, ExecutedCmd, LogItem, LogStream, EXIT_CODE_KILLED,
    EXIT_CODE_TIMEOUT, EXIT_CODE_UNKNOWN, VAR_AGENT_JOB_DIR, VAR_AGENT_PLUGIN_DIR,
};
use crate::error::EngineError;

use super::env_dump::parse_env_from_tar;
use super::log_pipeline::{LogPipeline, LogWriter};
use super::panic_message;
use super::state::JobState;

/// Workspace path inside job containers.
pub const DOCKER_WORKSPACE: &str = "/ws";

/// Plugin path inside job containers.
pub const DOCKER_PLUGIN_DIR: &str = "/ws/.plugins";

/// Env-dump path inside job containers.
pub const DOCKER_ENV_FILE: &str = "/tmp/.env";

/// Interpreter run by the exec session.
const SHELL: &str = "bash";

/// Cadence of `exec_inspect` polling while the session runs.
const EXEC_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace given to a resumed container's restart.
const RESUME_RESTART_TIMEOUT_SECS: isize = 5;

/// How long to wait for output drain before aborting stragglers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Failures inside the container lifecycle. All of them surface as an
/// Exception status, never as an `Err` from `start()`.
#[derive(Debug, thiserror::Error)]
enum DockerJobError {
    #[error(transparent)]
    Api(#[from] bollard::errors::Error),

    #[error("descriptor has no docker spec")]
    MissingDockerSpec,

    #[error("invalid port spec '{0}'")]
    PortSpec(String),

    #[error("exec session was not attached")]
    ExecNotAttached,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the supervised lifecycle came to an end.
enum Outcome {
    Finished(Result<i32, DockerJobError>),
    Panicked(String),
    TimedOut,
    Killed,
}

/// Single-shot container executor.
pub struct DockerExecutor {
    cmd: CmdIn,
    job: JobState,
    pipeline: LogPipeline,
    plugin_dir: PathBuf,
    /// Agent-level extra volumes mounted into every job container.
    volumes: Vec<DockerVolume>,
    /// The container actually used (resumed or created), recorded as
    /// soon as it is known so cleanup works on every exit path.
    container_id: Mutex<Option<String>>,
    /// Exec feeder/pump tasks, joined or aborted before the terminal
    /// transition.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DockerExecutor {
    /// Wire up a new executor. No I/O happens here; the daemon
    /// connection is made in `start()`.
    ///
    /// Container mode keeps the env dump in memory, so the log
    /// directory of the construction contract is accepted but unused.
    pub fn new(
        parent: CancellationToken,
        cmd: CmdIn,
        plugin_dir: impl Into<PathBuf>,
        _log_dir: impl Into<PathBuf>,
    ) -> Self {
        let pipeline = LogPipeline::new(&cmd.id);
        let job = JobState::new(&cmd, parent, pipeline.line_counter());
        Self {
            cmd,
            job,
            pipeline,
            plugin_dir: plugin_dir.into(),
            volumes: Vec::new(),
            container_id: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Mount additional pre-existing volumes into the job container.
    /// Volumes that do not exist are skipped with a warning.
    pub fn with_volumes(mut self, volumes: Vec<DockerVolume>) -> Self {
        self.volumes = volumes;
        self
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
    /// and runtime failures are reported through
    /// [`result`](Self::result), not as an `Err`.
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

        let docker = match Docker::connect_with_local_defaults() {
            Ok(docker) => docker,
            Err(e) => {
                self.job.finish(
                    CmdStatus::Exception,
                    EXIT_CODE_UNKNOWN,
                    Some(format!("cannot reach container runtime: {e}")),
                );
                self.pipeline.close();
                return Ok(());
            }
        };

        // Running starts here so that no log item (image pull progress
        // included) precedes start_at. The exec pid lands on the
        // record once the first inspect reports it.
        self.job.mark_running(0);

        let timeout = self.cmd.timeout();
        let cancel = self.job.cancel_token();
        let lifecycle = std::panic::AssertUnwindSafe(self.run_lifecycle(&docker)).catch_unwind();

        let outcome = tokio::select! {
            res = lifecycle => match res {
                Ok(finished) => Outcome::Finished(finished),
                Err(panic) => Outcome::Panicked(panic_message(&panic)),
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Killed,
        };

        if matches!(outcome, Outcome::TimedOut | Outcome::Killed) {
            self.job.kill();
        }
        self.drain_tasks().await;

        match outcome {
            Outcome::Finished(Ok(0)) => {
                self.job.finish(CmdStatus::Success, 0, None);
            }
            Outcome::Finished(Ok(code)) => {
                self.job.finish(
                    CmdStatus::Exception,
                    code,
                    Some(format!("exit status {code}")),
                );
            }
            Outcome::Finished(Err(e)) => {
                tracing::warn!(cmd_id = %self.cmd.id, error = %e, "container job failed");
                self.job
                    .finish(CmdStatus::Exception, EXIT_CODE_UNKNOWN, Some(e.to_string()));
            }
            Outcome::Panicked(message) => {
                self.job
                    .finish(CmdStatus::Exception, EXIT_CODE_UNKNOWN, Some(message));
            }
            Outcome::TimedOut => {
                tracing::debug!(cmd_id = %self.cmd.id, "container job timed out");
                self.job.finish(
                    CmdStatus::Timeout,
                    EXIT_CODE_TIMEOUT,
                    Some(format!("timed out after {}s", timeout.as_secs())),
                );
            }
            Outcome::Killed => {
                tracing::debug!(cmd_id = %self.cmd.id, "container job killed");
                self.job.finish(
                    CmdStatus::Killed,
                    EXIT_CODE_KILLED,
                    Some("killed by cancellation request".to_string()),
                );
            }
        }

        // Cleanup runs after the terminal status and on fresh client
        // calls; the cancelled job token has no hold over it.
        self.cleanup_container(&docker).await;
        self.pipeline.close();
        Ok(())
    }

    /// The happy-path lifecycle: volume, container, exec session, env
    /// capture. Returns the exec session's exit code.
    async fn run_lifecycle(&self, docker: &Docker) -> Result<i32, DockerJobError> {
        let option = self
            .cmd
            .docker
            .as_ref()
            .ok_or(DockerJobError::MissingDockerSpec)?;

        let mut vars = self.cmd.inputs.clone();
        let flow_dir = vars.expand(&self.cmd.flow_id);
        let work_dir = if flow_dir.is_empty() {
            DOCKER_WORKSPACE.to_string()
        } else {
            format!("{DOCKER_WORKSPACE}/{flow_dir}")
        };
        vars.insert(VAR_AGENT_JOB_DIR, work_dir.clone());
        vars.insert(VAR_AGENT_PLUGIN_DIR, DOCKER_PLUGIN_DIR);

        // Per-flow persistent volume, created on first use and reused
        // by every later job of the same flow.
        let volume_name = format!("flow-{}", self.cmd.flow_id);
        if volume_exists(docker, &volume_name).await? {
            tracing::info!(volume = %volume_name, "job volume exists");
        } else {
            docker
                .create_volume(CreateVolumeOptions {
                    name: volume_name.clone(),
                    ..Default::default()
                })
                .await?;
            tracing::info!(volume = %volume_name, "job volume created");
        }

        let mut binds = vec![format!("{volume_name}:{work_dir}")];
        for volume in &self.volumes {
            if volume_exists(docker, &volume.name).await? {
                binds.push(volume.to_bind());
            } else {
                tracing::warn!(volume = %volume.name, "volume not found, skipped");
            }
        }

        let image = vars.expand(&option.image);
        let entrypoint: Vec<String> = option.entrypoint.iter().map(|e| vars.expand(e)).collect();
        let ports: Vec<String> = option.ports.iter().map(|p| vars.expand(p)).collect();
        let (exposed_ports, port_bindings) = parse_port_specs(&ports)?;

        let config = Config::<String> {
            image: Some(image.clone()),
            env: Some(vars.to_env_strings()),
            entrypoint: (!entrypoint.is_empty()).then_some(entrypoint),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            working_dir: Some(work_dir),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: option.network_mode.as_deref().map(|m| vars.expand(m)),
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_id = match self.try_resume(docker).await {
            Some(resumed) => resumed,
            None => self.create_fresh(docker, &image, config).await?,
        };
        self.record_container(&container_id);

        self.copy_plugins(docker, &container_id).await?;
        let exec_id = self.run_exec_session(docker, &container_id).await?;
        let exit_code = self.wait_for_exit(docker, &exec_id).await?;
        self.export_env(docker, &container_id).await;

        Ok(exit_code)
    }

    /// Resume path: restart the hinted container when it exists in
    /// state `exited`. Anything else falls back to fresh creation; a
    /// hint that exists but cannot be reused is force-removed so the
    /// stale container does not linger.
    async fn try_resume(&self, docker: &Docker) -> Option<String> {
        let hint = self.cmd.container_id.as_deref().filter(|id| !id.is_empty())?;

        let inspect = match docker
            .inspect_container(hint, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => {
                tracing::warn!(container = %hint, "container not found, creating a new one");
                return None;
            }
            Err(e) => {
                tracing::warn!(container = %hint, error = %e, "inspect failed, creating a new one");
                return None;
            }
        };

        let status = inspect.state.and_then(|state| state.status);
        if status != Some(ContainerStateStatusEnum::EXITED) {
            tracing::warn!(container = %hint, ?status, "container not exited, creating a new one");
            self.remove_stale(docker, hint).await;
            return None;
        }

        match docker
            .restart_container(
                hint,
                Some(RestartContainerOptions {
                    t: RESUME_RESTART_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(container = %hint, "container resumed");
                Some(hint.to_string())
            }
            Err(e) => {
                tracing::warn!(container = %hint, error = %e, "resume failed, container deleted");
                self.remove_stale(docker, hint).await;
                None
            }
        }
    }

    async fn remove_stale(&self, docker: &Docker, container_id: &str) {
        let result = docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(container = %container_id, error = %e, "stale container removal failed");
        }
    }

    /// Fresh path: pull the image (progress goes to the log
    /// pipeline), create the container, start it.
    async fn create_fresh(
        &self,
        docker: &Docker,
        image: &str,
        config: Config<String>,
    ) -> Result<String, DockerJobError> {
        if let Some(writer) = self.pipeline.writer(LogStream::Stdout) {
            self.pull_image(docker, image, &writer).await?;
        }

        let created = docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        tracing::debug!(container = %created.id, "container created");
        // Recorded before start so a failed start still gets cleaned
        // up per the descriptor policy.
        self.record_container(&created.id);

        docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        tracing::debug!(container = %created.id, "container started");

        Ok(created.id)
    }

    async fn pull_image(
        &self,
        docker: &Docker,
        image: &str,
        writer: &LogWriter,
    ) -> Result<(), DockerJobError> {
        let reference = resolve_image_ref(image);
        tracing::info!(image = %reference, "pulling image");

        let mut progress = Box::pin(docker.create_image(
            Some(CreateImageOptions {
                from_image: reference,
                ..Default::default()
            }),
            None,
            None,
        ));

        while let Some(info) = progress.next().await {
            let info = info?;
            let mut line = info.status.unwrap_or_default();
            if let Some(detail) = info.progress {
                line.push(' ');
                line.push_str(&detail);
            }
            if !line.is_empty() {
                writer.emit(line);
            }
        }
        Ok(())
    }

    /// Stage the plugin files into the workspace as a tar stream
    /// rooted at `.plugins/<plugin>`.
    async fn copy_plugins(
        &self,
        docker: &Docker,
        container_id: &str,
    ) -> Result<(), DockerJobError> {
        let Some(plugin) = self.cmd.plugin.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(());
        };

        let source = self.plugin_dir.join(plugin);
        if !source.is_dir() {
            tracing::warn!(plugin = %plugin, path = %source.display(), "plugin directory missing, skipped");
            return Ok(());
        }

        let archive_root = format!(".plugins/{plugin}");
        let archive = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(archive_root, &source)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;

        docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: DOCKER_WORKSPACE,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        tracing::debug!(plugin = %plugin, "plugin dir staged in container");
        Ok(())
    }

    /// Create and attach the exec session, then spawn its stdin
    /// feeder and output pump.
    async fn run_exec_session(
        &self,
        docker: &Docker,
        container_id: &str,
    ) -> Result<String, DockerJobError> {
        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec![SHELL.to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let attached = docker.start_exec(&exec.id, None::<StartExecOptions>).await?;
        let StartExecResults::Attached { output, input } = attached else {
            return Err(DockerJobError::ExecNotAttached);
        };

        // Volume init scripts come first so user scripts see their
        // effects, then the env-dump sentinel and an explicit exit.
        let mut lines: Vec<String> = self
            .volumes
            .iter()
            .filter_map(|v| v.script_path())
            .map(|path| format!("source {path}"))
            .collect();
        lines.extend(self.cmd.scripts.iter().cloned());
        lines.push(format!("env > {DOCKER_ENV_FILE}"));
        lines.push("exit".to_string());

        let feeder = tokio::spawn(feed_exec_input(input, lines));
        let pump = match (
            self.pipeline.writer(LogStream::Stdout),
            self.pipeline.writer(LogStream::Stderr),
        ) {
            (Some(out), Some(err)) => Some(tokio::spawn(pump_exec_output(output, out, err))),
            _ => None,
        };

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(feeder);
        if let Some(pump) = pump {
            tasks.push(pump);
        }

        Ok(exec.id)
    }

    /// Poll the exec session until it stops running; records the
    /// in-namespace pid on the way.
    async fn wait_for_exit(&self, docker: &Docker, exec_id: &str) -> Result<i32, DockerJobError> {
        loop {
            let inspect = docker.inspect_exec(exec_id).await?;
            if let Some(pid) = inspect.pid.filter(|pid| *pid > 0) {
                self.job.set_process_id(pid);
            }
            if inspect.running != Some(true) {
                return Ok(inspect.exit_code.unwrap_or(EXIT_CODE_UNKNOWN as i64) as i32);
            }
            tokio::time::sleep(EXEC_POLL_INTERVAL).await;
        }
    }

    /// Copy the env dump out of the container and capture the
    /// filtered variables. Best effort: a missing dump leaves the
    /// output empty.
    async fn export_env(&self, docker: &Docker, container_id: &str) {
        let mut stream = Box::pin(docker.download_from_container(
            container_id,
            Some(DownloadFromContainerOptions {
                path: DOCKER_ENV_FILE,
            }),
        ));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) => {
                    tracing::warn!(cmd_id = %self.cmd.id, error = %e, "env dump download failed");
                    return;
                }
            }
        }

        match parse_env_from_tar(&archive, &self.cmd.env_filters) {
            Ok(output) => self.job.set_output(output),
            Err(e) => {
                tracing::warn!(cmd_id = %self.cmd.id, error = %e, "env dump unreadable");
            }
        }
    }

    fn record_container(&self, container_id: &str) {
        *self
            .container_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(container_id.to_string());
        self.job.set_container_id(container_id);
    }

    /// Join the exec feeder/pump tasks, aborting stragglers so no
    /// producer outlives the terminal transition.
    async fn drain_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for mut task in tasks {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// Post-job container policy: force-remove wins over stop; with
    /// neither flag the container is left for a later resume. Errors
    /// are logged and never mask the job result.
    async fn cleanup_container(&self, docker: &Docker) {
        let container_id = self
            .container_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let (Some(container_id), Some(option)) = (container_id, self.cmd.docker.as_ref()) else {
            return;
        };

        if option.delete_on_exit {
            let result = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            match result {
                Ok(()) => {
                    tracing::info!(container = %container_id, cmd_id = %self.cmd.id, "container deleted")
                }
                Err(e) => tracing::warn!(container = %container_id, error = %e, "container delete failed"),
            }
            return;
        }

        if option.stop_on_exit {
            let result = docker
                .stop_container(&container_id, None::<StopContainerOptions>)
                .await;
            match result {
                Ok(()) => {
                    tracing::info!(container = %container_id, cmd_id = %self.cmd.id, "container stopped")
                }
                Err(e) => tracing::warn!(container = %container_id, error = %e, "container stop failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Exec session I/O
// ---------------------------------------------------------------------------

/// Write the prepared lines to the exec session's stdin, then close
/// the write half by dropping it.
async fn feed_exec_input(
    mut input: Pin<Box<dyn tokio::io::AsyncWrite + Send>>,
    lines: Vec<String>,
) {
    for line in &lines {
        if input.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        if input.write_all(b"\n").await.is_err() {
            return;
        }
    }
    let _ = input.flush().await;
}

/// Demultiplex the attached exec output into the per-stream writers.
async fn pump_exec_output(
    mut output: Pin<
        Box<dyn futures::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>,
    >,
    mut stdout: LogWriter,
    mut stderr: LogWriter,
) {
    while let Some(message) = output.next().await {
        match message {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                stdout.push(&message);
            }
            Ok(LogOutput::StdErr { message }) => stderr.push(&message),
            Ok(LogOutput::StdIn { .. }) => {}
            Err(_) => break,
        }
    }
    stdout.finish();
    stderr.finish();
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fully qualify an image reference the way the original agent did:
/// references with a `/` live under `docker.io/`, bare ones under
/// `docker.io/library/`.
fn resolve_image_ref(image: &str) -> String {
    if image.contains('/') {
        format!("docker.io/{image}")
    } else {
        format!("docker.io/library/{image}")
    }
}

/// Exact-name volume lookup; the daemon's name filter matches
/// substrings, so re-check on our side.
async fn volume_exists(docker: &Docker, name: &str) -> Result<bool, DockerJobError> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);

    let response = docker.list_volumes(Some(ListVolumesOptions { filters })).await?;
    Ok(response
        .volumes
        .unwrap_or_default()
        .iter()
        .any(|volume| volume.name == name))
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;

/// Parse `[ip:]host:container[/proto]` port specs into the exposed
/// set and the host binding map.
fn parse_port_specs(specs: &[String]) -> Result<(ExposedPorts, PortMap), DockerJobError> {
    let mut exposed: ExposedPorts = HashMap::new();
    let mut bindings: PortMap = HashMap::new();

    for spec in specs {
        let (address, proto) = match spec.rsplit_once('/') {
            Some((address, proto)) if !proto.is_empty() => (address, proto),
            Some(_) => return Err(DockerJobError::PortSpec(spec.clone())),
            None => (spec.as_str(), "tcp"),
        };

        let fields: Vec<&str> = address.split(':').collect();
        let (host_ip, host_port, container_port) = match fields.as_slice() {
            [container] => (None, None, *container),
            [host, container] => (None, Some(*host), *container),
            [ip, host, container] => (Some(*ip), Some(*host), *container),
            _ => return Err(DockerJobError::PortSpec(spec.clone())),
        };

        if container_port.parse::<u16>().is_err() {
            return Err(DockerJobError::PortSpec(spec.clone()));
        }
        if let Some(port) = host_port {
            if port.parse::<u16>().is_err() {
                return Err(DockerJobError::PortSpec(spec.clone()));
            }
        }

        let key = format!("{container_port}/{proto}");
        exposed.insert(key.clone(), HashMap::new());

        if let Some(port) = host_port {
            let binding = PortBinding {
                host_ip: host_ip.map(str::to_string),
                host_port: Some(port.to_string()),
            };
            bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(binding);
        }
    }

    Ok((exposed, bindings))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_refs_resolve_under_docker_io() {
        assert_eq!(resolve_image_ref("ubuntu:18.04"), "docker.io/library/ubuntu:18.04");
        assert_eq!(resolve_image_ref("flowci/agent:1.0"), "docker.io/flowci/agent:1.0");
    }

    #[test]
    fn port_specs_parse_all_three_shapes() {
        let specs = vec![
            "80".to_string(),
            "8080:81".to_string(),
            "127.0.0.1:9090:90/udp".to_string(),
        ];
        let (exposed, bindings) = parse_port_specs(&specs).expect("parse");

        assert!(exposed.contains_key("80/tcp"));
        assert!(exposed.contains_key("81/tcp"));
        assert!(exposed.contains_key("90/udp"));
        assert_eq!(exposed.len(), 3);

        // Expose-only specs create no host binding.
        assert!(!bindings.contains_key("80/tcp"));

        let host_only = bindings["81/tcp"].as_ref().expect("bindings present");
        assert_eq!(host_only[0].host_ip, None);
        assert_eq!(host_only[0].host_port.as_deref(), Some("8080"));

        let with_ip = bindings["90/udp"].as_ref().expect("bindings present");
        assert_eq!(with_ip[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(with_ip[0].host_port.as_deref(), Some("9090"));
    }

    #[test]
    fn invalid_port_specs_are_rejected() {
        for bad in ["", "notaport", "1:2:3:4", "70000", "8080:80/"] {
            let specs = vec![bad.to_string()];
            assert!(parse_port_specs(&specs).is_err(), "spec {bad:?} should fail");
        }
    }

    #[test]
    fn exec_script_order_sources_volumes_first() {
        // The prelude ordering is assembled inline in
        // run_exec_session; this pins the script_path contract it
        // relies on.
        let volume = DockerVolume {
            name: "cache".into(),
            mount_path: "/cache".into(),
            script: Some("init.sh".into()),
        };
        assert_eq!(volume.script_path().as_deref(), Some("/cache/init.sh"));
    }
}
