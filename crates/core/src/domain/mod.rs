//! Domain types shared by the engine and its collaborators.

pub mod cmd;
pub mod variables;

pub use cmd::{
    CmdIn, CmdStatus, DockerOption, DockerVolume, ExecutedCmd, LogItem, LogStream,
    DEFAULT_JOB_TIMEOUT_SECS, EXIT_CODE_KILLED, EXIT_CODE_SUCCESS, EXIT_CODE_TIMEOUT,
    EXIT_CODE_UNKNOWN, VAR_AGENT_JOB_DIR, VAR_AGENT_PLUGIN_DIR,
};
pub use variables::{expand_env, Variables};
