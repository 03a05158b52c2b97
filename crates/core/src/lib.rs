//! Command execution engine for the flowagent CI build agent.
//!
//! The agent daemon receives job descriptors ([`CmdIn`]) from the
//! server, hands each one to an [`Executor`], and publishes the live
//! log stream plus the terminal [`ExecutedCmd`] record back. This
//! crate is that engine: the state machine from acceptance to a
//! terminal status, the host-shell and container strategies behind
//! one contract, the structured log pipeline, and the environment
//! capture that closes each job.
//!
//! Transport, registry presence, settings bootstrap and persistence
//! are the daemon's business and live outside this crate.

pub mod config;
pub mod domain;
pub mod error;
pub mod executor;

pub use config::AgentSettings;
pub use domain::{CmdIn, CmdStatus, ExecutedCmd, LogItem, LogStream, Variables};
pub use error::EngineError;
pub use executor::{DockerExecutor, Executor, ShellExecutor, EXIT_CMD};
