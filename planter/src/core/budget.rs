//! Per-session budgets and the time/depth checks derived from them.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Resource ceilings for one session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_depth: u32,
    pub max_steps_per_call: u32,
    pub max_observation_chars: usize,
    /// Cap on the objective plus artifacts handed to a delegated subtask.
    pub max_plan_chars: usize,
    pub command_timeout_sec: u64,
    pub max_shell_output_chars: usize,
    pub max_file_chars: usize,
    pub max_files_listed: usize,
    pub max_search_hits: usize,
    pub max_persisted_observations: usize,
    /// Wall-clock limit for a whole solve call; 0 means unbounded.
    pub max_solve_seconds: u64,
    pub recursive: bool,
    pub min_subtask_depth: u32,
    pub acceptance_criteria: bool,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_depth: 4,
            max_steps_per_call: 100,
            max_observation_chars: 6_000,
            max_plan_chars: 40_000,
            command_timeout_sec: 45,
            max_shell_output_chars: 16_000,
            max_file_chars: 20_000,
            max_files_listed: 400,
            max_search_hits: 200,
            max_persisted_observations: 400,
            max_solve_seconds: 0,
            recursive: true,
            min_subtask_depth: 0,
            acceptance_criteria: true,
        }
    }
}

impl Budget {
    /// Whether an investigation at `depth` may spawn a child.
    ///
    /// Children run at `depth + 1`, so requiring `depth < max_depth` keeps every
    /// step at or below `max_depth`.
    pub fn may_delegate(&self, depth: u32) -> bool {
        self.recursive && depth < self.max_depth && depth >= self.min_subtask_depth
    }

    /// Deadline for a solve call started at `started`, if time is bounded.
    pub fn solve_deadline(&self, started: Instant) -> Option<Instant> {
        (self.max_solve_seconds > 0).then(|| started + Duration::from_secs(self.max_solve_seconds))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }
}

/// Return true once `deadline` has passed. `None` never expires.
pub fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}
