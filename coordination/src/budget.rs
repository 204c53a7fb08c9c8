//! Budget tracker (design §4.8): configurable iteration/time/cost limits,
//! where `0` means unlimited.
//!
//! Grounded in the teacher's `harness::session::SessionManager` (tracks
//! elapsed time and an iteration counter against a configured max, returns
//! a typed "limit reached" condition) generalized to the three independent
//! limits design §4.8 names, with persisted `GetState`/`SetState` so the
//! controller can resume a budget across process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    None,
    Iterations,
    Time,
    Cost,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetState {
    pub completed_iterations: u64,
    pub accumulated_cost_usd: f64,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for BudgetState {
    fn default() -> Self {
        Self {
            completed_iterations: 0,
            accumulated_cost_usd: 0.0,
            started_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    /// 0 means unlimited.
    pub max_iterations: u64,
    /// 0 means unlimited.
    pub max_minutes: i64,
    /// 0.0 means unlimited.
    pub max_cost_usd: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            max_minutes: 0,
            max_cost_usd: 0.0,
        }
    }
}

pub struct BudgetTracker {
    limits: BudgetLimits,
    state: BudgetState,
}

impl BudgetTracker {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            state: BudgetState::default(),
        }
    }

    pub fn with_state(limits: BudgetLimits, state: BudgetState) -> Self {
        Self { limits, state }
    }

    pub fn get_state(&self) -> BudgetState {
        self.state.clone()
    }

    pub fn set_state(&mut self, state: BudgetState) {
        self.state = state;
    }

    /// Priority order when multiple limits are simultaneously exceeded:
    /// iterations, then time, then cost.
    pub fn check_budget(&self) -> StopReason {
        if self.limits.max_iterations != 0 && self.state.completed_iterations >= self.limits.max_iterations {
            return StopReason::Iterations;
        }

        if self.limits.max_minutes != 0 {
            if let Some(started_at) = self.state.started_at {
                let elapsed_minutes = (Utc::now() - started_at).num_minutes();
                if elapsed_minutes >= self.limits.max_minutes {
                    return StopReason::Time;
                }
            }
        }

        if self.limits.max_cost_usd != 0.0 && self.state.accumulated_cost_usd >= self.limits.max_cost_usd {
            return StopReason::Cost;
        }

        StopReason::None
    }

    /// Increment counters for one completed iteration; stamps `started_at`
    /// on the very first call.
    pub fn record_iteration(&mut self, cost_usd: f64) {
        if self.state.started_at.is_none() {
            self.state.started_at = Some(Utc::now());
        }
        self.state.completed_iterations += 1;
        self.state.accumulated_cost_usd += cost_usd;
    }
}
