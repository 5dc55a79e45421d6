//! Shape of persistent state, events, gaps, candidates and ledger entries.
//!
//! One logical document per agent ([`AgentState`]), plus the event queue and
//! ledger line formats. All timestamps are integer UTC milliseconds; all
//! bounded collections carry their caps as module constants so load-time
//! coercion and runtime appends agree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::{day_key, normalize_agent_id};

/// Current on-disk state document version.
pub const STATE_VERSION: u32 = 1;

pub const GOALS_CAP: usize = 500;
pub const TASKS_CAP: usize = 2000;
pub const RECENT_EVENTS_CAP: usize = 50;
pub const RECENT_CYCLES_CAP: usize = 50;
pub const GAPS_CAP: usize = 200;
pub const CANDIDATES_CAP: usize = 250;
pub const EXPERIMENTS_CAP: usize = 100;
pub const TRANSITIONS_CAP: usize = 200;
pub const DEDUPE_CAP: usize = 5000;
pub const EVIDENCE_CAP: usize = 10;

// =========================================================================
// Enums
// =========================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    Budget,
    Errors,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Manual => "manual",
            PauseReason::Budget => "budget",
            PauseReason::Errors => "errors",
        }
    }
}

/// Positions of the self-augmentation state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Design,
    Synthesize,
    Verify,
    Canary,
    Promote,
    Observe,
    Learn,
    Retire,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Design => "design",
            Stage::Synthesize => "synthesize",
            Stage::Verify => "verify",
            Stage::Canary => "canary",
            Stage::Promote => "promote",
            Stage::Observe => "observe",
            Stage::Learn => "learn",
            Stage::Retire => "retire",
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Discover
    }
}

/// Risk band of an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionClass {
    ReadOnly,
    ReversibleWrite,
    Destructive,
}

impl ExecutionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionClass::ReadOnly => "read_only",
            ExecutionClass::ReversibleWrite => "reversible_write",
            ExecutionClass::Destructive => "destructive",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GapCategory {
    Capability,
    Quality,
    Reliability,
    Safety,
    Cost,
    Latency,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Open,
    Planned,
    Addressed,
    Suppressed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Candidate,
    Planned,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Cron,
    Webhook,
    Email,
    Subagent,
    Manual,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Cron => "cron",
            EventSource::Webhook => "webhook",
            EventSource::Email => "email",
            EventSource::Subagent => "subagent",
            EventSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Ok,
    Error,
    Skipped,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Ok => "ok",
            CycleStatus::Error => "error",
            CycleStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }
}

// =========================================================================
// Events and queue lines
// =========================================================================

/// One queued or synthesized event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Event {
    /// Effective dedupe key: explicit key, else event id, else `source:type`.
    pub fn effective_dedupe_key(&self) -> String {
        if let Some(key) = self.dedupe_key.as_deref() {
            let key = key.trim();
            if !key.is_empty() {
                return key.to_string();
            }
        }
        if !self.id.trim().is_empty() {
            return self.id.trim().to_string();
        }
        format!("{}:{}", self.source.as_str(), self.event_type)
    }
}

// =========================================================================
// Gaps and candidates
// =========================================================================

/// A recurring, ranked indication that the agent lacks capability somewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub id: String,
    pub key: String,
    pub title: String,
    pub category: GapCategory,
    pub status: GapStatus,
    pub severity: u32,
    pub confidence: f64,
    pub score: u32,
    pub occurrences: u32,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    pub last_source: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSafety {
    pub execution_class: ExecutionClass,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// A proposed skill linked to one gap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SkillCandidate {
    pub id: String,
    pub source_gap_id: String,
    pub name: String,
    pub intent: String,
    pub status: CandidateStatus,
    pub priority: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub safety: CandidateSafety,
    #[serde(default)]
    pub tests: Vec<String>,
}

/// A candidate under live observation after promotion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub candidate_id: String,
    pub started_at: i64,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub from: Stage,
    pub to: Stage,
    pub ts: i64,
    pub reason: String,
}

// =========================================================================
// State document sections
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_token_budget: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_cycle_budget: Option<u32>,
    pub max_consecutive_errors: u32,
    pub auto_pause_on_budget_exhausted: bool,
    pub auto_resume_on_new_day_budget_pause: bool,
    pub error_pause_minutes: i64,
    pub stale_task_hours: i64,
    pub emit_daily_review_events: bool,
    pub emit_weekly_review_events: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            daily_token_budget: None,
            daily_cycle_budget: None,
            max_consecutive_errors: 5,
            auto_pause_on_budget_exhausted: true,
            auto_resume_on_new_day_budget_pause: true,
            error_pause_minutes: 60,
            stale_task_hours: 24,
            emit_daily_review_events: true,
            emit_weekly_review_events: true,
        }
    }
}

/// The UTC day over which cycle and token usage accumulate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetWindow {
    pub day_key: String,
    pub cycles_used: u32,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewMarkers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_daily_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_weekly_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStatus {
    Healthy,
    Regressed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AugmentationState {
    pub stage: Stage,
    pub stage_entered_at: i64,
    pub last_transition_at: i64,
    pub last_transition_reason: String,
    pub phase_run_count: u64,
    pub policy_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_eval_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_eval_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_canary_status: Option<CanaryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_canary_at: Option<i64>,
    pub gaps: Vec<Gap>,
    pub candidates: Vec<SkillCandidate>,
    pub active_experiments: Vec<Experiment>,
    pub transitions: Vec<TransitionRecord>,
}

impl Default for AugmentationState {
    fn default() -> Self {
        Self {
            stage: Stage::Discover,
            stage_entered_at: 0,
            last_transition_at: 0,
            last_transition_reason: String::new(),
            phase_run_count: 0,
            policy_version: 1,
            last_eval_score: None,
            last_eval_at: None,
            last_canary_status: None,
            last_canary_at: None,
            gaps: Vec::new(),
            candidates: Vec::new(),
            active_experiments: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

/// A granted operator approval for one action identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub action: String,
    pub approved_at: i64,
    pub expires_at: i64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub created_at: i64,
}

impl Default for Goal {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            created_at: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            status: TaskStatus::Pending,
            created_at: 0,
            updated_at: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Metrics {
    pub cycles: u64,
    pub ok: u64,
    pub error: u64,
    pub skipped: u64,
    pub consecutive_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CycleRecord {
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
    pub status: CycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events_processed: u32,
    pub tokens_used: u64,
}

impl Default for CycleRecord {
    fn default() -> Self {
        Self {
            started_at: 0,
            finished_at: 0,
            duration_ms: 0,
            status: CycleStatus::Skipped,
            summary: None,
            error: None,
            events_processed: 0,
            tokens_used: 0,
        }
    }
}

// =========================================================================
// The state document
// =========================================================================

/// The single durable document per agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentState {
    pub version: u32,
    pub agent_id: String,
    pub mission: String,
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<PauseReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
    pub goals_file: String,
    pub tasks_file: String,
    pub log_file: String,
    pub max_actions_per_run: u32,
    pub dedupe_window_ms: i64,
    pub max_queued_events: usize,
    pub safety: SafetyPolicy,
    pub budget: BudgetWindow,
    pub review: ReviewMarkers,
    pub augmentation: AugmentationState,
    pub approvals: BTreeMap<String, Approval>,
    /// task id -> day key for which a stale signal was already emitted.
    pub task_signals: BTreeMap<String, String>,
    /// event dedupe key -> epoch-ms of last admission.
    pub dedupe: BTreeMap<String, i64>,
    pub goals: Vec<Goal>,
    pub tasks: Vec<Task>,
    pub recent_events: Vec<Event>,
    pub recent_cycles: Vec<CycleRecord>,
    pub metrics: Metrics,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            agent_id: String::new(),
            mission: String::new(),
            paused: false,
            pause_reason: None,
            paused_at: None,
            goals_file: "AUTONOMY_GOALS.md".to_string(),
            tasks_file: "AUTONOMY_TASKS.md".to_string(),
            log_file: "AUTONOMY_LOG.md".to_string(),
            max_actions_per_run: 5,
            dedupe_window_ms: 3_600_000,
            max_queued_events: 100,
            safety: SafetyPolicy::default(),
            budget: BudgetWindow::default(),
            review: ReviewMarkers::default(),
            augmentation: AugmentationState::default(),
            approvals: BTreeMap::new(),
            task_signals: BTreeMap::new(),
            dedupe: BTreeMap::new(),
            goals: Vec::new(),
            tasks: Vec::new(),
            recent_events: Vec::new(),
            recent_cycles: Vec::new(),
            metrics: Metrics::default(),
        }
    }
}

/// Multiplier applied to the dedupe window when pruning the dedupe map.
/// Entries older than `dedupe_window_ms * DEDUPE_PRUNE_MULTIPLIER` are
/// dropped on load.
pub const DEDUPE_PRUNE_MULTIPLIER: i64 = 3;

impl AgentState {
    /// Coerce a freshly-parsed document into a valid state: trim strings,
    /// clamp tunables into their documented ranges, cap all bounded
    /// collections, restore the pause invariant, and prune the dedupe map.
    ///
    /// Never fails; every field has a defined fallback.
    pub fn normalize(&mut self, now_ms: i64) {
        self.version = STATE_VERSION;
        self.agent_id = normalize_agent_id(&self.agent_id);
        self.mission = self.mission.trim().to_string();

        for file in [&mut self.goals_file, &mut self.tasks_file, &mut self.log_file] {
            *file = file.trim().to_string();
        }
        if self.goals_file.is_empty() {
            self.goals_file = "AUTONOMY_GOALS.md".to_string();
        }
        if self.tasks_file.is_empty() {
            self.tasks_file = "AUTONOMY_TASKS.md".to_string();
        }
        if self.log_file.is_empty() {
            self.log_file = "AUTONOMY_LOG.md".to_string();
        }

        self.max_actions_per_run = self.max_actions_per_run.clamp(1, 20);
        self.dedupe_window_ms = self.dedupe_window_ms.clamp(60_000, 86_400_000);
        self.max_queued_events = self.max_queued_events.clamp(1, 500);

        self.safety.max_consecutive_errors = self.safety.max_consecutive_errors.clamp(1, 100);
        self.safety.error_pause_minutes = self.safety.error_pause_minutes.clamp(1, 1440);
        self.safety.stale_task_hours = self.safety.stale_task_hours.clamp(1, 720);

        // paused == false implies no reason and no paused_at.
        if !self.paused {
            self.pause_reason = None;
            self.paused_at = None;
        } else if self.pause_reason.is_none() {
            self.pause_reason = Some(PauseReason::Manual);
        }

        for gap in &mut self.augmentation.gaps {
            gap.severity = gap.severity.min(100);
            gap.confidence = clamp01(gap.confidence);
            gap.score = gap.score.min(10_000);
            gap.occurrences = gap.occurrences.max(1);
            if gap.evidence.len() > EVIDENCE_CAP {
                let start = gap.evidence.len() - EVIDENCE_CAP;
                gap.evidence.drain(..start);
            }
        }
        for candidate in &mut self.augmentation.candidates {
            candidate.priority = candidate.priority.min(10_000);
        }

        truncate_front(&mut self.goals, GOALS_CAP);
        truncate_front(&mut self.tasks, TASKS_CAP);
        truncate_front(&mut self.recent_events, RECENT_EVENTS_CAP);
        truncate_front(&mut self.recent_cycles, RECENT_CYCLES_CAP);
        self.augmentation.gaps.truncate(GAPS_CAP);
        self.augmentation.candidates.truncate(CANDIDATES_CAP);
        truncate_front(&mut self.augmentation.active_experiments, EXPERIMENTS_CAP);
        truncate_front(&mut self.augmentation.transitions, TRANSITIONS_CAP);

        let prune_before = now_ms - self.dedupe_window_ms * DEDUPE_PRUNE_MULTIPLIER;
        self.dedupe.retain(|_, ts| *ts >= prune_before);
        prune_dedupe_to_cap(&mut self.dedupe, DEDUPE_CAP);

        // Expired approvals are dropped rather than consulted-and-denied.
        self.approvals.retain(|_, approval| approval.expires_at > now_ms);
    }

    /// Refresh the budget window to the UTC day of `now_ms`. On rollover the
    /// counters reset atomically with the key. Returns true if it rolled.
    pub fn refresh_budget_window(&mut self, now_ms: i64) -> bool {
        let today = day_key(now_ms);
        if self.budget.day_key == today {
            return false;
        }
        self.budget.day_key = today;
        self.budget.cycles_used = 0;
        self.budget.tokens_used = 0;
        true
    }

    /// Record an event admission in the dedupe map, evicting the least
    /// recent entry when the map is full.
    pub fn record_dedupe(&mut self, key: String, now_ms: i64) {
        if self.dedupe.len() >= DEDUPE_CAP && !self.dedupe.contains_key(&key) {
            prune_dedupe_to_cap(&mut self.dedupe, DEDUPE_CAP - 1);
        }
        self.dedupe.insert(key, now_ms);
    }

    /// True when the key was admitted within the dedupe window.
    pub fn is_duplicate(&self, key: &str, now_ms: i64) -> bool {
        self.dedupe
            .get(key)
            .is_some_and(|ts| *ts + self.dedupe_window_ms > now_ms)
    }

    pub fn count_candidates(&self, status: CandidateStatus) -> usize {
        self.augmentation
            .candidates
            .iter()
            .filter(|c| c.status == status)
            .count()
    }

    pub fn has_open_gaps(&self) -> bool {
        self.augmentation
            .gaps
            .iter()
            .any(|g| g.status == GapStatus::Open)
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Keep the newest `cap` entries of a ring-buffer vector (oldest first).
fn truncate_front<T>(items: &mut Vec<T>, cap: usize) {
    if items.len() > cap {
        let start = items.len() - cap;
        items.drain(..start);
    }
}

/// Drop least-recently-admitted entries until the map fits the cap.
fn prune_dedupe_to_cap(dedupe: &mut BTreeMap<String, i64>, cap: usize) {
    while dedupe.len() > cap {
        let oldest = dedupe
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                dedupe.remove(&key);
            }
            None => break,
        }
    }
}

// =========================================================================
// Ledger entries
// =========================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    PhaseEnter,
    PhaseExit,
    PolicyDenied,
    DiscoveryUpdate,
    CandidateUpdate,
    Promotion,
    Rollback,
}

impl LedgerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventType::PhaseEnter => "phase_enter",
            LedgerEventType::PhaseExit => "phase_exit",
            LedgerEventType::PolicyDenied => "policy_denied",
            LedgerEventType::DiscoveryUpdate => "discovery_update",
            LedgerEventType::CandidateUpdate => "candidate_update",
            LedgerEventType::Promotion => "promotion",
            LedgerEventType::Rollback => "rollback",
        }
    }
}

/// One append-only audit line. Never mutated or deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub agent_id: String,
    pub ts: i64,
    pub correlation_id: String,
    pub event_type: LedgerEventType,
    pub stage: Stage,
    pub actor: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
    /// Digest of the previous line ("genesis" for the first entry).
    #[serde(default)]
    pub prev_digest: String,
    /// 16-hex SHA-1 chained over this entry; makes per-file tampering evident.
    #[serde(default)]
    pub digest: String,
}
