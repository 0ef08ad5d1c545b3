//! Restart rate limiting as the supervisor applies it.

use super::unit::RestartPolicy;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Inactive,
    Running,
    /// Waiting `delay` before the next start.
    Restarting,
    /// Exited with status 0; not restarted.
    Exited,
    /// Hit the rate limit. Only [`RestartTracker::reset`] leaves this state.
    Failed,
}

/// What the supervisor should do after an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    RestartAfter(Duration),
    Stay,
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    state: UnitState,
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            state: UnitState::Inactive,
            restarts: VecDeque::new(),
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn on_start(&mut self) {
        if self.state != UnitState::Failed {
            self.state = UnitState::Running;
        }
    }

    /// Record a process exit at `now`.
    pub fn on_exit(&mut self, status: i32, now: Instant) -> ExitAction {
        if self.state == UnitState::Failed {
            return ExitAction::GiveUp;
        }
        if status == 0 {
            self.state = UnitState::Exited;
            return ExitAction::Stay;
        }

        self.prune(now);
        if self.restarts.len() >= self.policy.max_restarts as usize {
            self.state = UnitState::Failed;
            return ExitAction::GiveUp;
        }

        self.restarts.push_back(now);
        self.state = UnitState::Restarting;
        ExitAction::RestartAfter(self.policy.delay)
    }

    /// Restarts counted against the limit at `now`.
    pub fn restarts_in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.restarts.len()
    }

    /// Operator intervention: clear the failure and the history.
    pub fn reset(&mut self) {
        self.state = UnitState::Inactive;
        self.restarts.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.restarts.front() {
            if now.saturating_duration_since(oldest) >= self.policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}
