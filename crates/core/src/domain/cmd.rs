//! Job descriptors and result records.
//!
//! [`CmdIn`] is the wire descriptor a job arrives as, [`ExecutedCmd`]
//! the single terminal record published when it finishes, and
//! [`LogItem`] the per-line log record streamed while it runs. All
//! three use camelCase field names on the wire and ignore unknown
//! fields so the server side can evolve independently.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::variables::Variables;

/// Workspace path exported to child processes as `AGENT_JOB_DIR`.
pub const VAR_AGENT_JOB_DIR: &str = "AGENT_JOB_DIR";

/// Plugin path exported to child processes as `AGENT_PLUGIN_DIR`.
pub const VAR_AGENT_PLUGIN_DIR: &str = "AGENT_PLUGIN_DIR";

/// Exit code recorded for a job that finished successfully.
pub const EXIT_CODE_SUCCESS: i32 = 0;

/// Exit code recorded when the child's status could not be determined
/// (signal-induced termination included).
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// Exit code recorded for a killed job.
pub const EXIT_CODE_KILLED: i32 = -1;

/// Exit code recorded for a timed-out job.
pub const EXIT_CODE_TIMEOUT: i32 = -100;

/// Wall-clock budget applied when the descriptor carries no timeout.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 1800;

// ---------------------------------------------------------------------------
// Status model
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// Exactly one of the four terminal variants is assigned per executor
/// instance; the first terminal transition wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdStatus {
    /// Accepted, not yet running.
    Pending,
    /// Child process (or exec session) is live.
    Running,
    /// Interpreter exited with code 0.
    Success,
    /// Interpreter exited non-zero, or a runtime operation failed.
    Exception,
    /// Cancelled through [`kill`](crate::executor::Executor::kill) or
    /// parent shutdown.
    Killed,
    /// Wall-clock budget exhausted.
    Timeout,
}

impl CmdStatus {
    /// `true` for the four end states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CmdStatus::Success | CmdStatus::Exception | CmdStatus::Killed | CmdStatus::Timeout
        )
    }
}

// ---------------------------------------------------------------------------
// Input descriptor
// ---------------------------------------------------------------------------

/// Job descriptor consumed by an executor. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmdIn {
    /// Stable identifier scoping all log and result records.
    pub id: String,

    /// Logical owner; names the per-flow persistent volume.
    #[serde(default)]
    pub flow_id: String,

    /// Shell fragments executed in order inside one interpreter
    /// process. Shell state persists between fragments.
    #[serde(default)]
    pub scripts: Vec<String>,

    /// Working directory (host mode only). `${NAME}` references are
    /// expanded before use.
    #[serde(default)]
    pub work_dir: Option<String>,

    /// Whole-job wall-clock budget in seconds; 0 means
    /// [`DEFAULT_JOB_TIMEOUT_SECS`].
    #[serde(default)]
    pub timeout: u64,

    /// Variables merged into the child environment.
    #[serde(default)]
    pub inputs: Variables,

    /// Key prefixes selecting which exported variables are captured
    /// on completion. Empty keeps everything.
    #[serde(default)]
    pub env_filters: Vec<String>,

    /// Container spec; presence selects the container strategy.
    #[serde(default)]
    pub docker: Option<DockerOption>,

    /// Container to resume (container mode only).
    #[serde(default)]
    pub container_id: Option<String>,

    /// Plugin whose files are staged under the plugin directory of the
    /// execution environment.
    #[serde(default)]
    pub plugin: Option<String>,
}

impl CmdIn {
    /// Whether the descriptor names a plugin.
    pub fn has_plugin(&self) -> bool {
        self.plugin.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// Effective wall-clock budget.
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout == 0 {
            DEFAULT_JOB_TIMEOUT_SECS
        } else {
            self.timeout
        };
        Duration::from_secs(secs)
    }
}

/// Container spec embedded in a [`CmdIn`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerOption {
    /// Image reference. A reference containing `/` resolves under
    /// `docker.io/`, otherwise under `docker.io/library/`.
    pub image: String,

    /// Container entrypoint, interpolated against the merged
    /// variable map.
    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// Port specs of the form `[ip:]host:container[/proto]`.
    #[serde(default)]
    pub ports: Vec<String>,

    /// Docker network mode (`bridge`, `host`, ...).
    #[serde(default)]
    pub network_mode: Option<String>,

    /// Stop the container once the job finishes.
    #[serde(default)]
    pub stop_on_exit: bool,

    /// Force-remove the container once the job finishes. Takes
    /// precedence over `stop_on_exit`.
    #[serde(default)]
    pub delete_on_exit: bool,
}

/// A user-declared volume mounted into job containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerVolume {
    /// Docker volume name; the volume must already exist.
    pub name: String,

    /// Mount point inside the container.
    pub mount_path: String,

    /// Optional init script file inside the volume, `source`d before
    /// user scripts.
    #[serde(default)]
    pub script: Option<String>,
}

impl DockerVolume {
    /// Absolute path of the init script inside the container, if any.
    pub fn script_path(&self) -> Option<String> {
        self.script
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| format!("{}/{}", self.mount_path.trim_end_matches('/'), s))
    }

    /// Bind string (`name:mountPath`) for the container host config.
    pub fn to_bind(&self) -> String {
        format!("{}:{}", self.name, self.mount_path)
    }
}

// ---------------------------------------------------------------------------
// Output records
// ---------------------------------------------------------------------------

/// Source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of job output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogItem {
    /// Id of the job the line belongs to.
    pub cmd_id: String,

    /// 1-based line number, strictly increasing per job across both
    /// streams.
    pub number: u64,

    /// Line content without the trailing terminator.
    pub content: String,

    /// Which child stream produced the line.
    pub stream: LogStream,

    /// When the engine framed the line (UTC).
    pub timestamp: DateTime<Utc>,
}

/// Terminal result record, one per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedCmd {
    /// Id of the originating [`CmdIn`].
    pub id: String,

    /// Pid of the interpreter. In container mode this is the pid
    /// inside the container namespace; cancellation must go through
    /// the runtime, never through this pid.
    pub process_id: i64,

    /// Current status; terminal once the executor completes.
    pub status: CmdStatus,

    /// Exit code per the status model ([`EXIT_CODE_TIMEOUT`],
    /// [`EXIT_CODE_KILLED`], or the interpreter's own code).
    pub code: i32,

    /// Captured environment, filtered by the descriptor's
    /// `envFilters`.
    #[serde(default)]
    pub output: Variables,

    /// Set on the transition to `Running` (or together with
    /// `finish_at` when the job never ran).
    pub start_at: Option<DateTime<Utc>>,

    /// Set on the terminal transition.
    pub finish_at: Option<DateTime<Utc>>,

    /// Failure detail when status is Exception, Killed or Timeout.
    #[serde(default)]
    pub error: String,

    /// Final log line number, overflowed lines included.
    pub log_size: u64,

    /// Container actually used (resumed or created); container mode
    /// only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub container_id: Option<String>,
}

impl ExecutedCmd {
    /// Fresh record for a just-accepted descriptor.
    pub fn pending(cmd: &CmdIn) -> Self {
        Self {
            id: cmd.id.clone(),
            process_id: 0,
            status: CmdStatus::Pending,
            code: EXIT_CODE_UNKNOWN,
            output: Variables::new(),
            start_at: None,
            finish_at: None,
            error: String::new(),
            log_size: 0,
            container_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
