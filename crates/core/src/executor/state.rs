//! Shared per-job state machine.
//!
//! Both execution strategies drive their [`ExecutedCmd`] through a
//! [`JobState`]: Pending to Running exactly once, then one terminal
//! transition where the first signal wins. The lock is a plain
//! `std::sync::Mutex` held only for field updates, never across an
//! await point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::domain::{CmdIn, CmdStatus, ExecutedCmd, Variables};

pub(crate) struct JobState {
    /// Job-scoped token, child of the token handed to the
    /// constructor. `kill()` cancels it; parent cancellation
    /// propagates into it.
    cancel: CancellationToken,
    /// Shared with the log pipeline; read once at the terminal
    /// transition to freeze `log_size`.
    line_counter: Arc<AtomicU64>,
    started: AtomicBool,
    result: Mutex<ExecutedCmd>,
}

impl JobState {
    pub fn new(cmd: &CmdIn, parent: CancellationToken, line_counter: Arc<AtomicU64>) -> Self {
        Self {
            cancel: parent.child_token(),
            line_counter,
            started: AtomicBool::new(false),
            result: Mutex::new(ExecutedCmd::pending(cmd)),
        }
    }

    /// Token all suspending operations of the job select against.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cancellation. Idempotent, callable from any task.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Claim the single `start()` slot. Returns `false` if the
    /// executor was started before.
    pub fn try_claim_start(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    /// Pending -> Running: records `start_at` and the interpreter pid.
    /// A no-op once the job left Pending.
    pub fn mark_running(&self, process_id: i64) {
        let mut result = self.lock();
        if result.status != CmdStatus::Pending {
            return;
        }
        result.status = CmdStatus::Running;
        result.start_at = Some(Utc::now());
        result.process_id = process_id;
    }

    /// Late pid update for strategies that learn the pid after the
    /// Running transition (container exec sessions).
    pub fn set_process_id(&self, process_id: i64) {
        self.lock().process_id = process_id;
    }

    pub fn set_container_id(&self, container_id: &str) {
        self.lock().container_id = Some(container_id.to_string());
    }

    pub fn set_output(&self, output: Variables) {
        self.lock().output = output;
    }

    /// Terminal transition. The first call wins; later calls return
    /// `false` and change nothing. Freezes `finish_at`, `code`,
    /// `error` and `log_size`, backfilling `start_at` for jobs that
    /// never reached Running.
    pub fn finish(&self, status: CmdStatus, code: i32, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());

        let mut result = self.lock();
        if result.status.is_terminal() {
            return false;
        }

        let now = Utc::now();
        if result.start_at.is_none() {
            result.start_at = Some(now);
        }
        result.finish_at = Some(now);
        result.status = status;
        result.code = code;
        if let Some(message) = error {
            result.error = message;
        }
        result.log_size = self.line_counter.load(Ordering::Acquire);
        true
    }

    /// Clone of the current record: in-progress before completion,
    /// terminal afterwards.
    pub fn snapshot(&self) -> ExecutedCmd {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ExecutedCmd> {
        self.result.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EXIT_CODE_KILLED, EXIT_CODE_TIMEOUT};

    fn state() -> JobState {
        let cmd: CmdIn = serde_json::from_str(r#"{"id": "job-1"}"#).expect("cmd");
        JobState::new(&cmd, CancellationToken::new(), Arc::new(AtomicU64::new(0)))
    }

    #[test]
    fn start_slot_claimed_once() {
        let state = state();
        assert!(state.try_claim_start());
        assert!(!state.try_claim_start());
    }

    #[test]
    fn running_transition_sets_start_at_and_pid() {
        let state = state();
        state.mark_running(42);

        let snap = state.snapshot();
        assert_eq!(snap.status, CmdStatus::Running);
        assert_eq!(snap.process_id, 42);
        assert!(snap.start_at.is_some());
        assert!(snap.finish_at.is_none());
    }

    #[test]
    fn first_terminal_signal_wins() {
        let state = state();
        state.mark_running(1);

        assert!(state.finish(CmdStatus::Timeout, EXIT_CODE_TIMEOUT, Some("timeout".into())));
        // A kill arriving after natural completion must not flip the status.
        assert!(!state.finish(CmdStatus::Killed, EXIT_CODE_KILLED, Some("killed".into())));

        let snap = state.snapshot();
        assert_eq!(snap.status, CmdStatus::Timeout);
        assert_eq!(snap.code, EXIT_CODE_TIMEOUT);
        assert_eq!(snap.error, "timeout");
    }

    #[test]
    fn finish_before_running_backfills_start_at() {
        let state = state();
        assert!(state.finish(CmdStatus::Killed, EXIT_CODE_KILLED, None));

        let snap = state.snapshot();
        assert_eq!(snap.process_id, 0);
        let start = snap.start_at.expect("start_at backfilled");
        let finish = snap.finish_at.expect("finish_at set");
        assert!(start <= finish);
    }

    #[test]
    fn kill_is_idempotent_and_observable() {
        let state = state();
        assert!(!state.is_cancelled());
        state.kill();
        state.kill();
        assert!(state.is_cancelled());
        assert!(state.cancel_token().is_cancelled());
    }

    #[test]
    fn parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let cmd: CmdIn = serde_json::from_str(r#"{"id": "job-2"}"#).expect("cmd");
        let state = JobState::new(&cmd, parent.clone(), Arc::new(AtomicU64::new(0)));

        parent.cancel();
        assert!(state.is_cancelled());
    }
}
