//! Agent-side settings threaded to executor construction.
//!
//! There is deliberately no process-wide singleton: the daemon builds
//! one [`AgentSettings`] at startup and hands it (or the directories
//! derived from it) to every executor it creates.

use std::path::PathBuf;

use crate::domain::variables::expand_env;

/// Default workspace when the host provides nothing else.
const DEFAULT_WORKSPACE: &str = "${HOME}/.flow.ci.agent";

/// Expanded default workspace path.
///
/// Host-mode jobs without a `workDir` run here.
pub fn default_workspace() -> PathBuf {
    PathBuf::from(expand_env(DEFAULT_WORKSPACE))
}

/// Directories the agent works out of.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Root workspace; host-mode jobs without a `workDir` run here.
    pub workspace: PathBuf,

    /// Scratch directory for engine-internal files such as the
    /// env-dump capture.
    pub logging_dir: PathBuf,

    /// Source directory holding plugin files, staged into the job's
    /// execution environment on demand.
    pub plugin_dir: PathBuf,
}

impl AgentSettings {
    /// Settings rooted at an explicit workspace path.
    ///
    /// `logs/` and `plugins/` are derived underneath it.
    pub fn with_workspace(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            logging_dir: workspace.join("logs"),
            plugin_dir: workspace.join("plugins"),
            workspace,
        }
    }

    /// Create all three directories if they do not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.workspace, &self.logging_dir, &self.plugin_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Absolute path of one plugin's source directory.
    pub fn plugin_source(&self, plugin: &str) -> PathBuf {
        self.plugin_dir.join(plugin)
    }
}

impl Default for AgentSettings {
    /// `${HOME}/.flow.ci.agent` with `logs/` and `plugins/` beneath.
    fn default() -> Self {
        Self::with_workspace(default_workspace())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_live_under_home() {
        let settings = AgentSettings::default();
        let home = std::env::var("HOME").expect("HOME is set in test environments");

        assert!(settings.workspace.starts_with(&home));
        assert!(settings.workspace.ends_with(".flow.ci.agent"));
        assert_eq!(settings.logging_dir, settings.workspace.join("logs"));
        assert_eq!(settings.plugin_dir, settings.workspace.join("plugins"));
    }

    #[test]
    fn explicit_workspace_derives_subdirs() {
        let settings = AgentSettings::with_workspace("/tmp/agent-ws");
        assert_eq!(settings.workspace, PathBuf::from("/tmp/agent-ws"));
        assert_eq!(settings.logging_dir, PathBuf::from("/tmp/agent-ws/logs"));
        assert_eq!(settings.plugin_source("git"), PathBuf::from("/tmp/agent-ws/plugins/git"));
    }
}
