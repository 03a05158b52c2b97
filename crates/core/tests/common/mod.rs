//! Shared helpers for the executor integration tests.

// Not every test binary uses every helper, so suppress dead_code
// warnings at the module level.
#![allow(dead_code)]

use std::path::PathBuf;

use flowagent_core::domain::CmdIn;
use tempfile::TempDir;

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`.
pub fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Sandbox directories for one test: workspace root plus the plugin,
/// log and working directories executors expect.
pub struct TestDirs {
    root: TempDir,
}

impl TestDirs {
    pub fn new() -> Self {
        let root = TempDir::new().expect("create test workspace");
        for sub in ["plugins", "logs", "work"] {
            std::fs::create_dir_all(root.path().join(sub)).expect("create test subdir");
        }
        Self { root }
    }

    pub fn plugin_dir(&self) -> PathBuf {
        self.root.path().join("plugins")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.path().join("logs")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.path().join("work")
    }
}

/// Build a descriptor from wire-shaped JSON.
pub fn cmd_from_json(json: serde_json::Value) -> CmdIn {
    serde_json::from_value(json).expect("valid CmdIn json")
}
