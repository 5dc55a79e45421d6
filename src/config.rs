//! Configuration records accepted by the orchestrator.
//!
//! One complete [`AutonomyConfig`] record with a defined default for every
//! field, plus a [`ConfigOverrides`] partial record for per-call tuning.
//! Hosts may deserialize either from their own config files; the core never
//! reads config from disk itself.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::gates::GateThresholds;
use crate::policy::PolicyConfig;
use crate::types::{AgentState, PauseReason, SafetyPolicy};

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct AutonomyConfig {
    pub mission: String,
    pub goals_file: String,
    pub tasks_file: String,
    pub log_file: String,
    pub max_actions_per_run: u32,
    pub dedupe_window_minutes: i64,
    pub max_queued_events: usize,
    pub daily_token_budget: Option<u64>,
    pub daily_cycle_budget: Option<u32>,
    pub max_consecutive_errors: u32,
    pub auto_pause_on_budget_exhausted: bool,
    pub auto_resume_on_new_day_budget_pause: bool,
    pub error_pause_minutes: i64,
    pub stale_task_hours: i64,
    pub emit_daily_review_events: bool,
    pub emit_weekly_review_events: bool,
    pub paused: bool,
    pub policy: PolicyConfig,
    pub gates: GateThresholds,
    pub hook_timeout_ms: u64,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            mission: default_mission(),
            goals_file: default_goals_file(),
            tasks_file: default_tasks_file(),
            log_file: default_log_file(),
            max_actions_per_run: default_max_actions_per_run(),
            dedupe_window_minutes: default_dedupe_window_minutes(),
            max_queued_events: default_max_queued_events(),
            daily_token_budget: None,
            daily_cycle_budget: None,
            max_consecutive_errors: default_max_consecutive_errors(),
            auto_pause_on_budget_exhausted: true,
            auto_resume_on_new_day_budget_pause: true,
            error_pause_minutes: default_error_pause_minutes(),
            stale_task_hours: default_stale_task_hours(),
            emit_daily_review_events: true,
            emit_weekly_review_events: true,
            paused: false,
            policy: PolicyConfig::default(),
            gates: GateThresholds::default(),
            hook_timeout_ms: default_hook_timeout_ms(),
        }
    }
}

fn default_mission() -> String {
    "Discover capability gaps and close them safely".to_string()
}
fn default_goals_file() -> String {
    "AUTONOMY_GOALS.md".to_string()
}
fn default_tasks_file() -> String {
    "AUTONOMY_TASKS.md".to_string()
}
fn default_log_file() -> String {
    "AUTONOMY_LOG.md".to_string()
}
fn default_max_actions_per_run() -> u32 {
    5
}
fn default_dedupe_window_minutes() -> i64 {
    60
}
fn default_max_queued_events() -> usize {
    100
}
fn default_max_consecutive_errors() -> u32 {
    5
}
fn default_error_pause_minutes() -> i64 {
    60
}
fn default_stale_task_hours() -> i64 {
    24
}
fn default_hook_timeout_ms() -> u64 {
    10_000
}

impl AutonomyConfig {
    /// Build the default state document for a fresh agent from this config.
    pub fn initial_state(&self, agent_id: &str, now_ms: i64) -> AgentState {
        let mut state = AgentState {
            agent_id: agent_id.to_string(),
            mission: self.mission.clone(),
            paused: self.paused,
            goals_file: self.goals_file.clone(),
            tasks_file: self.tasks_file.clone(),
            log_file: self.log_file.clone(),
            max_actions_per_run: self.max_actions_per_run,
            dedupe_window_ms: self.dedupe_window_minutes.saturating_mul(60_000),
            max_queued_events: self.max_queued_events,
            safety: self.safety_policy(),
            ..AgentState::default()
        };
        if state.paused {
            state.pause_reason = Some(PauseReason::Manual);
            state.paused_at = Some(now_ms);
        }
        state.augmentation.stage_entered_at = now_ms;
        state.augmentation.last_transition_at = now_ms;
        state.augmentation.policy_version = self.policy.policy_version;
        state.normalize(now_ms);
        state.refresh_budget_window(now_ms);
        state
    }

    pub fn safety_policy(&self) -> SafetyPolicy {
        SafetyPolicy {
            daily_token_budget: self.daily_token_budget,
            daily_cycle_budget: self.daily_cycle_budget,
            max_consecutive_errors: self.max_consecutive_errors,
            auto_pause_on_budget_exhausted: self.auto_pause_on_budget_exhausted,
            auto_resume_on_new_day_budget_pause: self.auto_resume_on_new_day_budget_pause,
            error_pause_minutes: self.error_pause_minutes,
            stale_task_hours: self.stale_task_hours,
            emit_daily_review_events: self.emit_daily_review_events,
            emit_weekly_review_events: self.emit_weekly_review_events,
        }
    }
}

/// Partial overrides applied on top of a loaded state by `prepare` (and by
/// the operator tune control). Every field is explicitly optional; absent
/// fields leave the stored value untouched.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigOverrides {
    pub mission: Option<String>,
    pub goals_file: Option<String>,
    pub tasks_file: Option<String>,
    pub log_file: Option<String>,
    pub max_actions_per_run: Option<u32>,
    pub dedupe_window_minutes: Option<i64>,
    pub max_queued_events: Option<usize>,
    /// `Some(None)` clears a stored budget; `None` leaves it untouched.
    pub daily_token_budget: Option<Option<u64>>,
    pub daily_cycle_budget: Option<Option<u32>>,
    pub max_consecutive_errors: Option<u32>,
    pub auto_pause_on_budget_exhausted: Option<bool>,
    pub auto_resume_on_new_day_budget_pause: Option<bool>,
    pub error_pause_minutes: Option<i64>,
    pub stale_task_hours: Option<i64>,
    pub emit_daily_review_events: Option<bool>,
    pub emit_weekly_review_events: Option<bool>,
    pub paused: Option<bool>,
}

impl ConfigOverrides {
    /// Apply explicit fields onto the state. Pause toggling here is a manual
    /// operator action, so the reason is always `manual`.
    pub fn apply(&self, state: &mut AgentState, now_ms: i64) {
        if let Some(mission) = &self.mission {
            state.mission = mission.trim().to_string();
        }
        if let Some(file) = &self.goals_file {
            state.goals_file = file.clone();
        }
        if let Some(file) = &self.tasks_file {
            state.tasks_file = file.clone();
        }
        if let Some(file) = &self.log_file {
            state.log_file = file.clone();
        }
        if let Some(v) = self.max_actions_per_run {
            state.max_actions_per_run = v;
        }
        if let Some(v) = self.dedupe_window_minutes {
            state.dedupe_window_ms = v.saturating_mul(60_000);
        }
        if let Some(v) = self.max_queued_events {
            state.max_queued_events = v;
        }
        if let Some(v) = self.daily_token_budget {
            state.safety.daily_token_budget = v;
        }
        if let Some(v) = self.daily_cycle_budget {
            state.safety.daily_cycle_budget = v;
        }
        if let Some(v) = self.max_consecutive_errors {
            state.safety.max_consecutive_errors = v;
        }
        if let Some(v) = self.auto_pause_on_budget_exhausted {
            state.safety.auto_pause_on_budget_exhausted = v;
        }
        if let Some(v) = self.auto_resume_on_new_day_budget_pause {
            state.safety.auto_resume_on_new_day_budget_pause = v;
        }
        if let Some(v) = self.error_pause_minutes {
            state.safety.error_pause_minutes = v;
        }
        if let Some(v) = self.stale_task_hours {
            state.safety.stale_task_hours = v;
        }
        if let Some(v) = self.emit_daily_review_events {
            state.safety.emit_daily_review_events = v;
        }
        if let Some(v) = self.emit_weekly_review_events {
            state.safety.emit_weekly_review_events = v;
        }
        if let Some(paused) = self.paused {
            if paused && !state.paused {
                state.paused = true;
                state.pause_reason = Some(PauseReason::Manual);
                state.paused_at = Some(now_ms);
            } else if !paused && state.paused {
                state.paused = false;
                state.pause_reason = None;
                state.paused_at = None;
            }
        }
        state.normalize(now_ms);
    }

    /// Parse overrides from a loose JSON object (host-facing convenience).
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn from_map(map: &BTreeMap<String, serde_json::Value>) -> Self {
        let value = serde_json::Value::Object(map.clone().into_iter().collect());
        Self::from_json(&value)
    }
}
