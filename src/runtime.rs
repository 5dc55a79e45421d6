//! Runtime orchestrator: `prepare` / `finalize` bind one cycle together.
//!
//! `prepare` loads and reconciles state, enforces pause and budget rules,
//! takes the run-lock, drains and synthesizes events, runs the stage step
//! of the Skill Forge, gates and performs the next transition, audits it
//! all, and hands the host a prepared snapshot. The host does its own work
//! (usually an LLM call) and reports back through `finalize`, which records
//! the cycle, applies error auto-pause, appends the workspace log block and
//! releases the lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::canary::{
    self, derive_inputs_from_cycles, evaluate_canary, CanaryInputs,
    DEFAULT_MAX_LATENCY_REGRESSION_PCT,
};
use crate::config::{AutonomyConfig, ConfigOverrides};
use crate::eval::{default_pack, evaluate_pack};
use crate::forge::{plan_candidates, synthesize_candidates, verify_candidates};
use crate::gaps::upsert_signals;
use crate::gates::check_promotion;
use crate::hooks::{SignalHook, SignalHookContext};
use crate::ledger::NewLedgerEntry;
use crate::phase::{
    execution_class_for_stage, resolve_next_stage, successor, transition_stage,
};
use crate::policy;
use crate::run_lock::{self, RunLockGuard};
use crate::signals::normalize_events;
use crate::store::{AgentStore, DrainReport, NewEvent};
use crate::types::{
    AgentState, CandidateStatus, CanaryStatus, CycleRecord, CycleStatus, Event, EventSource,
    ExecutionClass, LedgerEntry, LedgerEventType, PauseReason, Stage, TaskStatus,
};
use crate::utils::{day_key, iso_week_key, normalize_agent_id, truncate_str};
use crate::workspace::{append_log_block, ensure_workspace_files, CycleLogBlock};

fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Token usage one cycle reports back through `finalize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone)]
pub struct PrepareParams {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    pub overrides: Option<ConfigOverrides>,
    /// Explicit canary metrics from the host's own telemetry. When absent
    /// the canary stage derives them from recent cycle history.
    pub canary: Option<CanaryInputs>,
    /// Tests pin this; hosts leave it `None` for wall-clock time.
    pub now_ms: Option<i64>,
}

/// A cycle ready to run.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub agent_id: String,
    pub state: AgentState,
    pub prompt: String,
    pub events: Vec<Event>,
    pub dropped_duplicates: usize,
    pub dropped_invalid: usize,
    pub dropped_overflow: usize,
    pub remaining_events: usize,
    pub cycle_started_at: i64,
    pub lock_token: String,
}

#[derive(Debug)]
pub enum PrepareOutcome {
    Ready(Box<Prepared>),
    Skipped { reason: String, state: Box<AgentState> },
}

#[derive(Debug, Clone)]
pub struct FinalizeParams {
    pub state: AgentState,
    pub workspace_dir: PathBuf,
    pub status: CycleStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub events: Vec<Event>,
    pub dropped_duplicates: usize,
    pub dropped_invalid: usize,
    pub dropped_overflow: usize,
    pub remaining_events: usize,
    pub usage: Option<TokenUsage>,
    pub cycle_started_at: i64,
    pub lock_token: String,
    pub now_ms: Option<i64>,
}

struct CycleWork {
    events: Vec<Event>,
    drain: DrainReport,
    prompt: String,
}

/// The per-process autonomy runtime for a fleet of agents.
pub struct Runtime {
    store: AgentStore,
    config: AutonomyConfig,
    hook: Option<Arc<dyn SignalHook>>,
    held_locks: Mutex<HashMap<String, RunLockGuard>>,
}

impl Runtime {
    pub fn new(store: AgentStore, config: AutonomyConfig) -> Self {
        Self {
            store,
            config,
            hook: None,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn SignalHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    // =====================================================================
    // Prepare
    // =====================================================================

    pub async fn prepare(&self, params: PrepareParams) -> anyhow::Result<PrepareOutcome> {
        let now = params.now_ms.unwrap_or_else(wall_clock_ms);
        let agent_key = normalize_agent_id(&params.agent_id);

        let mut state = self
            .store
            .load_state(&params.agent_id, &self.config, now)
            .await?;
        if let Some(overrides) = &params.overrides {
            overrides.apply(&mut state, now);
        }
        state.refresh_budget_window(now);

        let resumed_reason = self.try_auto_resume(&mut state, now);

        if state.paused {
            let reason = format!(
                "autonomy paused ({})",
                state.pause_reason.map(|r| r.as_str()).unwrap_or("manual")
            );
            self.store.save_state(&state).await?;
            return Ok(PrepareOutcome::Skipped {
                reason,
                state: Box::new(state),
            });
        }

        if budget_exhausted(&state) {
            if state.safety.auto_pause_on_budget_exhausted {
                state.paused = true;
                state.pause_reason = Some(PauseReason::Budget);
                state.paused_at = Some(now);
                info!(agent_id = %state.agent_id, "budget exhausted, auto-pausing");
            }
            let reason = format!("autonomy budget exhausted for {}", state.budget.day_key);
            self.store.save_state(&state).await?;
            return Ok(PrepareOutcome::Skipped {
                reason,
                state: Box::new(state),
            });
        }

        let agent_dir = self.store.agent_dir(&params.agent_id);
        let Some(guard) = run_lock::acquire(&agent_dir, &agent_key, now).await? else {
            return Ok(PrepareOutcome::Skipped {
                reason: "autonomy run already in progress".to_string(),
                state: Box::new(state),
            });
        };
        let lock_token = guard.token().to_string();

        match self
            .run_cycle_steps(&params, &mut state, resumed_reason, now)
            .await
        {
            Ok(work) => {
                self.held_locks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(lock_token.clone(), guard);
                Ok(PrepareOutcome::Ready(Box::new(Prepared {
                    agent_id: state.agent_id.clone(),
                    prompt: work.prompt,
                    events: work.events,
                    dropped_duplicates: work.drain.dropped_duplicates,
                    dropped_invalid: work.drain.dropped_invalid,
                    dropped_overflow: work.drain.dropped_overflow,
                    remaining_events: work.drain.remaining,
                    cycle_started_at: now,
                    lock_token,
                    state,
                })))
            }
            Err(e) => {
                // Failure semantics: the error surfaces, the lock does not stay held.
                let _ = run_lock::release(guard).await;
                Err(e)
            }
        }
    }

    fn try_auto_resume(&self, state: &mut AgentState, now_ms: i64) -> Option<&'static str> {
        if !state.paused {
            return None;
        }
        match state.pause_reason {
            Some(PauseReason::Budget)
                if state.safety.auto_resume_on_new_day_budget_pause
                    && !budget_exhausted(state) =>
            {
                clear_pause(state);
                info!(agent_id = %state.agent_id, "budget window fresh, auto-resuming");
                Some("budget-window-rollover")
            }
            Some(PauseReason::Errors) => {
                let cooldown_ms = state.safety.error_pause_minutes * 60_000;
                if state
                    .paused_at
                    .is_some_and(|paused_at| now_ms - paused_at >= cooldown_ms)
                {
                    clear_pause(state);
                    info!(agent_id = %state.agent_id, "error cooldown elapsed, auto-resuming");
                    Some("error-cooldown-elapsed")
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Steps 7-13 of the cycle, run strictly under the run-lock.
    async fn run_cycle_steps(
        &self,
        params: &PrepareParams,
        state: &mut AgentState,
        resumed_reason: Option<&'static str>,
        now: i64,
    ) -> anyhow::Result<CycleWork> {
        ensure_workspace_files(&params.workspace_dir, state).await?;

        let max_events = (state.max_actions_per_run as usize).min(state.max_queued_events);
        let drain = self
            .store
            .drain_events(&params.agent_id, state, max_events, now)
            .await?;

        let mut events: Vec<Event> = Vec::new();
        events.push(synthetic_event("cron.tick", None, None, now));
        if let Some(reason) = resumed_reason {
            events.push(synthetic_event(
                "autonomy.resume",
                Some(json!({ "reason": reason })),
                None,
                now,
            ));
        }
        events.extend(drain.events.iter().cloned());
        self.synthesize_health_events(state, &drain, &mut events, now);
        self.collect_hook_events(params, state, &mut events, now).await;
        self.apply_approval_grants(state, &mut events, now);

        let signals = normalize_events(&events);
        if !signals.is_empty() {
            upsert_signals(&mut state.augmentation.gaps, &signals, now);
            self.audit(
                state,
                LedgerEventType::DiscoveryUpdate,
                format!(
                    "{} signals processed, {} gaps tracked",
                    signals.len(),
                    state.augmentation.gaps.len()
                ),
                None,
                None,
                now,
            )
            .await?;
        }

        state.augmentation.phase_run_count += 1;
        self.run_stage_step(params, state, now).await?;
        self.advance_stage(state, &mut events, now).await?;

        state.recent_events.extend(events.iter().cloned());
        state.normalize(now);
        self.store.save_state(state).await?;

        let prompt = render_prompt(state, &events);
        Ok(CycleWork {
            events,
            drain,
            prompt,
        })
    }

    /// Queue-health, review-cadence and stale-task synthetic events.
    fn synthesize_health_events(
        &self,
        state: &mut AgentState,
        drain: &DrainReport,
        events: &mut Vec<Event>,
        now: i64,
    ) {
        if drain.dropped_overflow > 0 {
            events.push(synthetic_event(
                "autonomy.queue.overflow",
                Some(json!({ "dropped": drain.dropped_overflow })),
                Some("autonomy.queue.overflow".to_string()),
                now,
            ));
        }
        if drain.dropped_invalid > 0 {
            events.push(synthetic_event(
                "autonomy.queue.invalid",
                Some(json!({ "dropped": drain.dropped_invalid })),
                Some("autonomy.queue.invalid".to_string()),
                now,
            ));
        }

        let today = day_key(now);
        if state.safety.emit_daily_review_events
            && state.review.last_daily_key.as_deref() != Some(today.as_str())
        {
            state.review.last_daily_key = Some(today.clone());
            events.push(synthetic_event(
                "autonomy.review.daily",
                Some(json!({ "dayKey": today })),
                Some(format!("review.daily:{}", today)),
                now,
            ));
        }
        let week = iso_week_key(now);
        if state.safety.emit_weekly_review_events
            && state.review.last_weekly_key.as_deref() != Some(week.as_str())
        {
            state.review.last_weekly_key = Some(week.clone());
            events.push(synthetic_event(
                "autonomy.review.weekly",
                Some(json!({ "weekKey": week })),
                Some(format!("review.weekly:{}", week)),
                now,
            ));
        }

        let stale_after_ms = state.safety.stale_task_hours * 3_600_000;
        let stale: Vec<(String, TaskStatus, String, i64)> = state
            .tasks
            .iter()
            .filter(|task| {
                matches!(task.status, TaskStatus::Blocked | TaskStatus::InProgress)
                    && now - task.updated_at >= stale_after_ms
                    && state.task_signals.get(&task.id) != Some(&today)
            })
            .map(|task| {
                (
                    task.id.clone(),
                    task.status,
                    task.title.clone(),
                    (now - task.updated_at) / 3_600_000,
                )
            })
            .collect();
        for (task_id, status, title, age_hours) in stale {
            state.task_signals.insert(task_id.clone(), today.clone());
            events.push(synthetic_event(
                &format!("autonomy.task.stale.{}", status.as_str()),
                Some(json!({
                    "taskId": task_id,
                    "title": title,
                    "status": status.as_str(),
                    "ageHours": age_hours,
                })),
                Some(format!("task.stale:{}:{}", task_id, today)),
                now,
            ));
        }
    }

    /// Invoke the plugin signal hook once, bounded by the configured
    /// timeout. Hook trouble never fails the cycle.
    async fn collect_hook_events(
        &self,
        params: &PrepareParams,
        state: &AgentState,
        events: &mut Vec<Event>,
        now: i64,
    ) {
        let Some(hook) = &self.hook else {
            return;
        };
        let context = SignalHookContext {
            agent_id: state.agent_id.clone(),
            workspace_dir: params.workspace_dir.clone(),
            stage: state.augmentation.stage,
            now_ms: now,
        };
        let timeout = Duration::from_millis(self.config.hook_timeout_ms);
        match tokio::time::timeout(timeout, hook.collect(&context, events)).await {
            Ok(Ok(signals)) => {
                for signal in signals {
                    events.push(signal.into_event(now));
                }
            }
            Ok(Err(e)) => {
                warn!(agent_id = %state.agent_id, error = %e, "signal hook failed");
            }
            Err(_) => {
                warn!(agent_id = %state.agent_id, "signal hook timed out");
            }
        }
    }

    /// Absorb `autonomy.approval.grant` events into the approvals map.
    fn apply_approval_grants(&self, state: &mut AgentState, events: &mut Vec<Event>, now: i64) {
        let grants: Vec<(String, String)> = events
            .iter()
            .filter(|event| event.event_type == "autonomy.approval.grant")
            .filter_map(|event| {
                let payload = event.payload.as_ref()?;
                let action = payload.get("action")?.as_str()?.trim().to_string();
                if action.is_empty() {
                    return None;
                }
                let source = payload
                    .get("source")
                    .and_then(|s| s.as_str())
                    .unwrap_or("operator")
                    .to_string();
                Some((action, source))
            })
            .collect();

        for (action, source) in grants {
            policy::grant_approval(state, &action, &source, &self.config.policy, now);
            events.push(synthetic_event(
                "autonomy.approval.applied",
                Some(json!({ "action": action })),
                None,
                now,
            ));
        }
    }

    /// The stage-specific Skill Forge / canary / eval step.
    async fn run_stage_step(
        &self,
        params: &PrepareParams,
        state: &mut AgentState,
        now: i64,
    ) -> anyhow::Result<()> {
        match state.augmentation.stage {
            Stage::Design => {
                let created = plan_candidates(
                    &mut state.augmentation.gaps,
                    &mut state.augmentation.candidates,
                    now,
                );
                if !created.is_empty() {
                    self.audit(
                        state,
                        LedgerEventType::CandidateUpdate,
                        format!("planned {} new candidates", created.len()),
                        Some(json!({ "candidateIds": created })),
                        None,
                        now,
                    )
                    .await?;
                }
            }
            Stage::Synthesize => {
                let report =
                    synthesize_candidates(&params.workspace_dir, &mut state.augmentation.candidates, now)
                        .await?;
                if !report.synthesized.is_empty() {
                    self.audit(
                        state,
                        LedgerEventType::CandidateUpdate,
                        format!(
                            "synthesized {} candidates ({} files written)",
                            report.synthesized.len(),
                            report.files_written.len()
                        ),
                        Some(json!({
                            "candidateIds": report.synthesized,
                            "files": report.files_written,
                        })),
                        None,
                        now,
                    )
                    .await?;
                }
            }
            Stage::Verify => {
                let reports =
                    verify_candidates(&params.workspace_dir, &mut state.augmentation.candidates, now)
                        .await?;
                if !reports.is_empty() {
                    let verified = reports.iter().filter(|r| r.passed).count();
                    self.audit(
                        state,
                        LedgerEventType::CandidateUpdate,
                        format!("verified {} of {} candidates", verified, reports.len()),
                        Some(serde_json::to_value(&reports)?),
                        None,
                        now,
                    )
                    .await?;
                }
            }
            Stage::Canary => {
                let inputs = params.canary.unwrap_or_else(|| {
                    derive_inputs_from_cycles(
                        &state.recent_cycles,
                        self.config.gates.maximum_error_rate,
                        DEFAULT_MAX_LATENCY_REGRESSION_PCT,
                    )
                });
                let outcome = evaluate_canary(inputs);
                let demoted = canary::apply_outcome(state, &outcome, now);
                match outcome.status {
                    CanaryStatus::Regressed => {
                        self.audit(
                            state,
                            LedgerEventType::Rollback,
                            format!("canary regression: {}", outcome.reason),
                            Some(json!({ "demotedCandidateIds": demoted })),
                            None,
                            now,
                        )
                        .await?;
                    }
                    CanaryStatus::Healthy => {
                        self.audit(
                            state,
                            LedgerEventType::Promotion,
                            format!("canary healthy: {}", outcome.reason),
                            None,
                            None,
                            now,
                        )
                        .await?;
                    }
                }
            }
            Stage::Promote => {
                let score = evaluate_pack(state, &default_pack());
                state.augmentation.last_eval_score = Some(score);
                state.augmentation.last_eval_at = Some(now);
            }
            Stage::Retire => {
                let retired = retire_experiments(state);
                if !retired.is_empty() {
                    self.audit(
                        state,
                        LedgerEventType::CandidateUpdate,
                        format!("retired {} experiments, gaps closed", retired.len()),
                        Some(json!({ "experimentIds": retired })),
                        None,
                        now,
                    )
                    .await?;
                }
            }
            Stage::Discover | Stage::Observe | Stage::Learn => {}
        }
        Ok(())
    }

    /// Resolve, gate, and perform the stage transition; audit either the
    /// transition or the denial.
    async fn advance_stage(
        &self,
        state: &mut AgentState,
        events: &mut Vec<Event>,
        now: i64,
    ) -> anyhow::Result<()> {
        let current = state.augmentation.stage;
        let mut next = resolve_next_stage(state);
        let mut denial: Option<(String, Vec<String>)> = None;

        if current == Stage::Promote && next != current {
            let gate = check_promotion(state, &self.config.gates);
            if !gate.passed {
                denial = Some((
                    format!("autonomy.stage.{}", next.as_str()),
                    gate.reasons,
                ));
                next = current;
            }
        }

        if denial.is_none() && next != current {
            let action = format!("autonomy.stage.{}", next.as_str());
            let class = execution_class_for_stage(next);
            let approved = policy::has_live_approval(state, &action, now);
            let decision = policy::evaluate(&action, class, &self.config.policy, approved);
            if decision.allowed {
                // A gated approval is single-use.
                if approved && class != ExecutionClass::ReadOnly {
                    policy::consume_approval(state, &action);
                }
            } else {
                denial = Some((action, vec![decision.reason]));
                next = current;
            }
        }

        if let Some((action, reasons)) = denial {
            let reason_text = reasons.join("; ");
            warn!(
                agent_id = %state.agent_id,
                action = %action,
                reason = %reason_text,
                "stage advance denied, freezing stage"
            );
            events.push(synthetic_event(
                "autonomy.augmentation.policy.denied",
                Some(json!({
                    "action": action,
                    "stage": current.as_str(),
                    "reason": reason_text,
                    "reasons": reasons,
                })),
                None,
                now,
            ));
            self.audit(
                state,
                LedgerEventType::PolicyDenied,
                format!("denied {}: {}", action, reason_text),
                Some(json!({ "reasons": reasons })),
                None,
                now,
            )
            .await?;
            return Ok(());
        }

        if next == current {
            return Ok(());
        }

        let held_ms = now - state.augmentation.stage_entered_at;
        let reason = if next == successor(current) {
            format!("{} objectives met", current.as_str())
        } else {
            "no actionable work, returning to discovery".to_string()
        };
        transition_stage(state, next, &reason, now)?;
        info!(
            agent_id = %state.agent_id,
            from = current.as_str(),
            to = next.as_str(),
            held_ms,
            "stage transition"
        );

        // Leaving promote means the verified set went live: put each
        // candidate under observation.
        if current == Stage::Promote && next == Stage::Observe {
            let promoted = open_experiments(state, now);
            if !promoted.is_empty() {
                self.audit(
                    state,
                    LedgerEventType::Promotion,
                    format!("promoted {} candidates into observation", promoted.len()),
                    Some(json!({ "experimentIds": promoted })),
                    None,
                    now,
                )
                .await?;
            }
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        events.push(synthetic_event(
            "autonomy.phase.exit",
            Some(json!({
                "stage": current.as_str(),
                "lane": "autonomy",
                "durationMs": held_ms,
            })),
            None,
            now,
        ));
        events.push(synthetic_event(
            "autonomy.phase.enter",
            Some(json!({ "stage": next.as_str(), "lane": "autonomy" })),
            None,
            now,
        ));
        self.audit(
            state,
            LedgerEventType::PhaseExit,
            format!("exited {} after {}ms", current.as_str(), held_ms.max(0)),
            None,
            Some(correlation_id.clone()),
            now,
        )
        .await?;
        // The enter entry records the new stage.
        let entry = NewLedgerEntry {
            agent_id: state.agent_id.clone(),
            event_type: LedgerEventType::PhaseEnter,
            stage: next,
            actor: "autonomy".to_string(),
            summary: format!("entered {}: {}", next.as_str(), reason),
            evidence: None,
            correlation_id: Some(correlation_id),
        };
        self.store.append_ledger(entry, now).await?;
        Ok(())
    }

    async fn audit(
        &self,
        state: &AgentState,
        event_type: LedgerEventType,
        summary: String,
        evidence: Option<serde_json::Value>,
        correlation_id: Option<String>,
        now: i64,
    ) -> anyhow::Result<LedgerEntry> {
        self.store
            .append_ledger(
                NewLedgerEntry {
                    agent_id: state.agent_id.clone(),
                    event_type,
                    stage: state.augmentation.stage,
                    actor: "autonomy".to_string(),
                    summary,
                    evidence,
                    correlation_id,
                },
                now,
            )
            .await
    }

    // =====================================================================
    // Finalize
    // =====================================================================

    pub async fn finalize(&self, params: FinalizeParams) -> anyhow::Result<()> {
        let now = params.now_ms.unwrap_or_else(wall_clock_ms);
        let lock_token = params.lock_token.clone();

        let result = self.finalize_inner(params, now).await;

        let guard = self
            .held_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&lock_token);
        match guard {
            Some(guard) => run_lock::release(guard).await?,
            None => warn!(lock_token = %lock_token, "finalize without a held run-lock"),
        }
        result
    }

    async fn finalize_inner(&self, params: FinalizeParams, now: i64) -> anyhow::Result<()> {
        let mut state = params.state;
        let tokens = params.usage.map(|u| u.total()).unwrap_or(0);
        let duration_ms = (now - params.cycle_started_at).max(0);

        state.recent_cycles.push(CycleRecord {
            started_at: params.cycle_started_at,
            finished_at: now,
            duration_ms,
            status: params.status,
            summary: params.summary.clone(),
            error: params.error.clone(),
            events_processed: params.events.len() as u32,
            tokens_used: tokens,
        });

        state.metrics.cycles += 1;
        state.metrics.last_cycle_at = Some(now);
        match params.status {
            CycleStatus::Ok => {
                state.metrics.ok += 1;
                state.metrics.consecutive_errors = 0;
            }
            CycleStatus::Error => {
                state.metrics.error += 1;
                state.metrics.consecutive_errors += 1;
                state.metrics.last_error = params
                    .error
                    .clone()
                    .or_else(|| params.summary.clone())
                    .or_else(|| Some("cycle failed".to_string()));
            }
            CycleStatus::Skipped => {
                state.metrics.skipped += 1;
            }
        }

        if params.status != CycleStatus::Skipped {
            state.budget.cycles_used += 1;
            state.budget.tokens_used = state.budget.tokens_used.saturating_add(tokens);
        }

        if state.metrics.consecutive_errors >= state.safety.max_consecutive_errors && !state.paused
        {
            state.paused = true;
            state.pause_reason = Some(PauseReason::Errors);
            state.paused_at = Some(now);
            warn!(
                agent_id = %state.agent_id,
                consecutive_errors = state.metrics.consecutive_errors,
                "consecutive error limit reached, auto-pausing"
            );
        }

        append_log_block(
            &params.workspace_dir,
            &state,
            &CycleLogBlock {
                now_ms: now,
                status: params.status,
                summary: params.summary.as_deref(),
                error: params.error.as_deref(),
                events: &params.events,
                dropped_duplicates: params.dropped_duplicates,
                dropped_invalid: params.dropped_invalid,
                dropped_overflow: params.dropped_overflow,
                remaining_events: params.remaining_events,
            },
        )
        .await?;

        state.normalize(now);
        self.store.save_state(&state).await?;
        Ok(())
    }

    // =====================================================================
    // Operator controls and read surfaces
    // =====================================================================

    pub async fn pause(&self, agent_id: &str, now_ms: Option<i64>) -> anyhow::Result<AgentState> {
        let now = now_ms.unwrap_or_else(wall_clock_ms);
        let mut state = self.store.load_state(agent_id, &self.config, now).await?;
        if !state.paused {
            state.paused = true;
            state.pause_reason = Some(PauseReason::Manual);
            state.paused_at = Some(now);
            self.store.save_state(&state).await?;
        }
        Ok(state)
    }

    pub async fn resume(&self, agent_id: &str, now_ms: Option<i64>) -> anyhow::Result<AgentState> {
        let now = now_ms.unwrap_or_else(wall_clock_ms);
        let mut state = self.store.load_state(agent_id, &self.config, now).await?;
        if state.paused {
            clear_pause(&mut state);
            self.store.save_state(&state).await?;
        }
        Ok(state)
    }

    pub async fn tune(
        &self,
        agent_id: &str,
        overrides: &ConfigOverrides,
        now_ms: Option<i64>,
    ) -> anyhow::Result<AgentState> {
        let now = now_ms.unwrap_or_else(wall_clock_ms);
        let mut state = self.store.load_state(agent_id, &self.config, now).await?;
        overrides.apply(&mut state, now);
        self.store.save_state(&state).await?;
        Ok(state)
    }

    pub async fn enqueue_event(&self, new: NewEvent) -> anyhow::Result<Event> {
        self.store.enqueue_event(new).await
    }

    pub async fn load_state(&self, agent_id: &str) -> anyhow::Result<AgentState> {
        self.store
            .load_state(agent_id, &self.config, wall_clock_ms())
            .await
    }

    pub async fn has_state(&self, agent_id: &str) -> bool {
        self.store.has_state(agent_id).await
    }

    pub async fn reset_runtime(&self, agent_id: &str) -> anyhow::Result<()> {
        self.store.reset_runtime(agent_id).await
    }

    pub async fn read_ledger_entries(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<LedgerEntry> {
        self.store.read_ledger(agent_id, limit, offset).await
    }
}

/// Open one experiment per verified candidate (idempotent by derived id).
fn open_experiments(state: &mut AgentState, now_ms: i64) -> Vec<String> {
    let existing: std::collections::HashSet<String> = state
        .augmentation
        .active_experiments
        .iter()
        .map(|e| e.id.clone())
        .collect();
    let mut opened = Vec::new();
    let new_experiments: Vec<crate::types::Experiment> = state
        .augmentation
        .candidates
        .iter()
        .filter(|c| c.status == CandidateStatus::Verified)
        .map(|c| crate::types::Experiment {
            id: crate::utils::sha1_16(&format!("experiment:{}", c.id)),
            candidate_id: c.id.clone(),
            started_at: now_ms,
            note: c.intent.clone(),
        })
        .filter(|e| !existing.contains(&e.id))
        .collect();
    for experiment in new_experiments {
        opened.push(experiment.id.clone());
        state.augmentation.active_experiments.push(experiment);
    }
    opened
}

/// Close every active experiment and mark its source gap addressed.
fn retire_experiments(state: &mut AgentState) -> Vec<String> {
    let experiments = std::mem::take(&mut state.augmentation.active_experiments);
    let mut retired = Vec::new();
    for experiment in experiments {
        if let Some(candidate) = state
            .augmentation
            .candidates
            .iter()
            .find(|c| c.id == experiment.candidate_id)
        {
            let gap_id = candidate.source_gap_id.clone();
            if let Some(gap) = state
                .augmentation
                .gaps
                .iter_mut()
                .find(|g| g.id == gap_id)
            {
                gap.status = crate::types::GapStatus::Addressed;
            }
        }
        retired.push(experiment.id);
    }
    retired
}

fn budget_exhausted(state: &AgentState) -> bool {
    let cycles_out = state
        .safety
        .daily_cycle_budget
        .is_some_and(|budget| state.budget.cycles_used >= budget);
    let tokens_out = state
        .safety
        .daily_token_budget
        .is_some_and(|budget| state.budget.tokens_used >= budget);
    cycles_out || tokens_out
}

fn clear_pause(state: &mut AgentState) {
    state.paused = false;
    state.pause_reason = None;
    state.paused_at = None;
}

fn synthetic_event(
    event_type: &str,
    payload: Option<serde_json::Value>,
    dedupe_key: Option<String>,
    now_ms: i64,
) -> Event {
    Event {
        id: uuid::Uuid::new_v4().to_string(),
        source: EventSource::Cron,
        event_type: event_type.to_string(),
        ts: now_ms,
        dedupe_key,
        payload,
    }
}

/// Deterministic cycle briefing for the host's LLM call.
fn render_prompt(state: &AgentState, events: &[Event]) -> String {
    let mut out = String::new();
    out.push_str("# Autonomy cycle briefing\n\n");
    out.push_str(&format!("Agent: {}\n", state.agent_id));
    out.push_str(&format!("Mission: {}\n", state.mission));
    out.push_str(&format!(
        "Stage: {} (run {} in this phase)\n",
        state.augmentation.stage.as_str(),
        state.augmentation.phase_run_count
    ));
    out.push_str(&format!(
        "Budget today ({}): {} cycles used{}, {} tokens used{}\n",
        state.budget.day_key,
        state.budget.cycles_used,
        state
            .safety
            .daily_cycle_budget
            .map(|b| format!(" of {}", b))
            .unwrap_or_default(),
        state.budget.tokens_used,
        state
            .safety
            .daily_token_budget
            .map(|b| format!(" of {}", b))
            .unwrap_or_default(),
    ));

    out.push_str(&format!(
        "\nCandidates: {} candidate, {} planned, {} verified, {} rejected\n",
        state.count_candidates(CandidateStatus::Candidate),
        state.count_candidates(CandidateStatus::Planned),
        state.count_candidates(CandidateStatus::Verified),
        state.count_candidates(CandidateStatus::Rejected),
    ));

    if !state.augmentation.gaps.is_empty() {
        out.push_str("\nTop gaps:\n");
        for gap in state.augmentation.gaps.iter().take(3) {
            out.push_str(&format!(
                "- [{}] {} (score {}, seen {}x)\n",
                gap.id,
                truncate_str(&gap.title, 60),
                gap.score,
                gap.occurrences
            ));
        }
    }

    out.push_str(&format!("\nEvents this cycle: {}\n", events.len()));
    for event in events.iter().take(10) {
        out.push_str(&format!(
            "- {} ({})\n",
            event.event_type,
            event.source.as_str()
        ));
    }
    out
}
