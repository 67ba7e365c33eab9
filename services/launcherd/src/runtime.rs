use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::supervisor::ActiveProcess;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Stopped,
    Starting,
    Loading,
    Ready,
    Stopping,
    Error,
}

impl Phase {
    /// Child process is expected to be alive.
    pub fn is_running(self) -> bool {
        matches!(self, Phase::Starting | Phase::Loading | Phase::Ready)
    }

    /// A new `start()` is only accepted from here.
    pub fn accepts_start(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Error)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Error, Starting)
                | (Starting, Loading)
                | (Starting, Ready)
                | (Loading, Ready)
                | (Starting, Error)
                | (Loading, Error)
                | (Ready, Error)
                | (Starting, Stopping)
                | (Loading, Stopping)
                | (Ready, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
                | (Error, Stopped)
        )
    }
}

/// The single source of truth for "what is running". Lives behind the
/// supervisor's state mutex.
pub struct ServerState {
    pub phase: Phase,
    pub model_id: Option<String>,
    pub model_name: Option<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub started_instant: Option<Instant>,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
    /// Bumped on every start; background tasks carry the value they were
    /// spawned for and must not write once it moved on.
    pub generation: u64,
    pub(crate) active: Option<ActiveProcess>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            phase: Phase::Stopped,
            model_id: None,
            model_name: None,
            pid: None,
            started_at: None,
            started_instant: None,
            last_error: None,
            exit_code: None,
            generation: 0,
            active: None,
        }
    }
}

impl ServerState {
    /// Applies a transition if the state machine allows it. Returns false and
    /// leaves the phase untouched otherwise.
    pub fn transition(&mut self, next: Phase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.can_transition_to(next) {
            tracing::warn!(from = ?self.phase, to = ?next, "rejected phase transition");
            return false;
        }
        tracing::debug!(from = ?self.phase, to = ?next, generation = self.generation, "phase");
        self.phase = next;
        true
    }

    /// Records the error and freezes the clock: a dead process has no uptime.
    pub fn fail(&mut self, message: String) {
        self.last_error = Some(message);
        self.started_instant = None;
        self.transition(Phase::Error);
    }

    /// Forgets the process handle and timing; keeps `last_error`/`exit_code`
    /// so a client can still read why the previous run ended.
    pub fn clear_process(&mut self) {
        self.active = None;
        self.pid = None;
        self.model_id = None;
        self.model_name = None;
        self.started_at = None;
        self.started_instant = None;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.phase,
            running: self.phase.is_running(),
            ready: self.phase == Phase::Ready,
            model: self.model_id.clone(),
            name: self.model_name.clone(),
            pid: self.pid,
            generation: self.generation,
            started_at: self.started_at,
            uptime_seconds: self.started_instant.map(|t| t.elapsed().as_secs()),
            last_error: self.last_error.clone(),
            exit_code: self.exit_code,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub phase: Phase,
    pub running: bool,
    pub ready: bool,
    pub model: Option<String>,
    pub name: Option<String>,
    pub pid: Option<u32>,
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 6] = [
        Phase::Stopped,
        Phase::Starting,
        Phase::Loading,
        Phase::Ready,
        Phase::Stopping,
        Phase::Error,
    ];

    #[test]
    fn test_happy_path_cycle() {
        let mut st = ServerState::default();
        for next in [Phase::Starting, Phase::Loading, Phase::Ready, Phase::Stopping, Phase::Stopped] {
            assert!(st.transition(next), "{next:?}");
        }
        assert_eq!(st.phase, Phase::Stopped);
    }

    #[test]
    fn test_rejected_transitions_leave_phase() {
        let mut st = ServerState::default();
        assert!(!st.transition(Phase::Ready));
        assert!(!st.transition(Phase::Error));
        assert_eq!(st.phase, Phase::Stopped);

        st.transition(Phase::Starting);
        st.transition(Phase::Stopping);
        // a late probe result must not resurrect a stopping server
        assert!(!st.transition(Phase::Ready));
        assert!(!st.transition(Phase::Loading));
        assert_eq!(st.phase, Phase::Stopping);
    }

    #[test]
    fn test_error_reachable_from_running_phases_only() {
        for from in ALL {
            let ok = from.can_transition_to(Phase::Error);
            assert_eq!(ok, from.is_running(), "{from:?}");
        }
    }

    #[test]
    fn test_start_accepted_only_from_stopped_or_error() {
        for from in ALL {
            assert_eq!(from.accepts_start(), from.can_transition_to(Phase::Starting), "{from:?}");
        }
    }

    #[test]
    fn test_fail_keeps_error_after_clear() {
        let mut st = ServerState::default();
        st.transition(Phase::Starting);
        st.model_id = Some("qwen3-30b".into());
        st.started_instant = Some(Instant::now());
        st.fail("boom".into());
        assert_eq!(st.phase, Phase::Error);
        assert_eq!(st.snapshot().uptime_seconds, None);
        assert_eq!(st.snapshot().model.as_deref(), Some("qwen3-30b"));

        st.clear_process();
        let snap = st.snapshot();
        assert_eq!(snap.model, None);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
        assert!(!snap.running);
    }
}
