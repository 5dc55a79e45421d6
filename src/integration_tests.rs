//! Cross-component scenarios: full augmentation cycles driven through the
//! public orchestrator surface, exactly as a host would drive them.

use serde_json::json;

use crate::config::AutonomyConfig;
use crate::forge::skill_path;
use crate::ledger::{verify_chain, ChainStatus};
use crate::runtime::{PrepareOutcome, Prepared, Runtime};
use crate::store::NewEvent;
use crate::testing::{fixture, Fixture, FixtureOptions};
use crate::types::{
    CandidateStatus, CycleStatus, EventSource, LedgerEventType, Stage,
};

const T0: i64 = 1_709_253_000_000; // 2024-03-01T00:30:00Z

async fn run_cycle(fx: &Fixture, runtime: &Runtime, agent: &str, now: i64) -> Prepared {
    match runtime
        .prepare(fx.prepare_params(agent, now))
        .await
        .expect("prepare")
    {
        PrepareOutcome::Ready(prepared) => *prepared,
        PrepareOutcome::Skipped { reason, .. } => panic!("unexpected skip: {}", reason),
    }
}

async fn run_and_finish(fx: &Fixture, runtime: &Runtime, agent: &str, now: i64) -> Stage {
    let prepared = run_cycle(fx, runtime, agent, now).await;
    let stage = prepared.state.augmentation.stage;
    fx.finish(runtime, prepared, CycleStatus::Ok).await;
    stage
}

fn grant_event(agent: &str, action: &str) -> NewEvent {
    NewEvent {
        agent_id: agent.to_string(),
        source: EventSource::Manual,
        event_type: "autonomy.approval.grant".to_string(),
        dedupe_key: Some(format!("grant:{}", action)),
        payload: Some(json!({ "action": action, "source": "operator:test" })),
        ts: Some(0),
    }
}

#[tokio::test]
async fn full_augmentation_walk_from_discovery_to_retirement() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "walker";
    let hour = 3_600_000;

    // Seed two reliability incidents so discovery has something to chew on.
    for key in ["incident-a", "incident-b"] {
        runtime
            .enqueue_event(NewEvent {
                agent_id: agent.to_string(),
                source: EventSource::Webhook,
                event_type: "deploy.pipeline.failed".to_string(),
                dedupe_key: Some(key.to_string()),
                payload: Some(json!({ "title": format!("Deploy failure {}", key) })),
                ts: Some(T0 - hour),
            })
            .await
            .expect("enqueue");
    }

    // Cycle 1: discover ingests signals, opens gaps, advances to design.
    let stage = run_and_finish(&fx, &runtime, agent, T0).await;
    assert_eq!(stage, Stage::Design);
    let state = runtime.load_state(agent).await.expect("load");
    assert!(state.augmentation.gaps.len() >= 2, "gaps opened from signals");

    // Cycle 2: design plans candidates, advances to synthesize.
    let stage = run_and_finish(&fx, &runtime, agent, T0 + hour).await;
    assert_eq!(stage, Stage::Synthesize);
    let state = runtime.load_state(agent).await.expect("load");
    assert!(state.count_candidates(CandidateStatus::Candidate) >= 2);

    // Cycle 3: synthesize writes skill documents, advances to verify.
    let stage = run_and_finish(&fx, &runtime, agent, T0 + 2 * hour).await;
    assert_eq!(stage, Stage::Verify);
    let state = runtime.load_state(agent).await.expect("load");
    let planned = state
        .augmentation
        .candidates
        .iter()
        .find(|c| c.status == CandidateStatus::Planned)
        .expect("planned candidate");
    assert!(
        skill_path(&fx.workspace(), &planned.name).exists(),
        "generated document on disk"
    );

    // Cycle 4: verify passes the generated documents, advances to canary.
    let stage = run_and_finish(&fx, &runtime, agent, T0 + 3 * hour).await;
    assert_eq!(stage, Stage::Canary);
    let state = runtime.load_state(agent).await.expect("load");
    assert!(state.count_candidates(CandidateStatus::Verified) >= 2);

    // Cycle 5: canary is healthy, but promote is destructive and needs an
    // operator approval. The stage freezes and the denial is audited.
    let prepared = run_cycle(&fx, &runtime, agent, T0 + 4 * hour).await;
    assert_eq!(prepared.state.augmentation.stage, Stage::Canary);
    let denial = prepared
        .events
        .iter()
        .find(|e| e.event_type == "autonomy.augmentation.policy.denied")
        .expect("denial event");
    assert_eq!(
        denial.payload.as_ref().expect("payload")["action"],
        "autonomy.stage.promote"
    );
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;
    let denials = runtime
        .read_ledger_entries(agent, 100, 0)
        .await
        .into_iter()
        .filter(|e| e.event_type == LedgerEventType::PolicyDenied)
        .count();
    assert!(denials >= 1, "policy denial audited");

    // Operator grants the promote approval; the next cycle applies it,
    // transitions, and consumes the approval.
    runtime
        .enqueue_event(grant_event(agent, "autonomy.stage.promote"))
        .await
        .expect("enqueue grant");
    let prepared = run_cycle(&fx, &runtime, agent, T0 + 5 * hour).await;
    assert_eq!(prepared.state.augmentation.stage, Stage::Promote);
    assert!(
        prepared
            .events
            .iter()
            .any(|e| e.event_type == "autonomy.approval.applied"),
        "grant absorbed"
    );
    assert!(
        prepared.state.approvals.is_empty(),
        "approval consumed on use"
    );
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;

    // Cycle 7: promote runs the long-horizon eval, clears the gates and
    // moves to observe.
    let prepared = run_cycle(&fx, &runtime, agent, T0 + 6 * hour).await;
    assert_eq!(prepared.state.augmentation.stage, Stage::Observe);
    let score = prepared
        .state
        .augmentation
        .last_eval_score
        .expect("eval score recorded");
    assert!(score >= 0.6, "score: {}", score);
    assert!(
        !prepared.state.augmentation.active_experiments.is_empty(),
        "promotion opens experiments for observation"
    );
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;

    // Observe -> learn, then learn -> retire (destructive, approved).
    assert_eq!(
        run_and_finish(&fx, &runtime, agent, T0 + 7 * hour).await,
        Stage::Learn
    );
    runtime
        .enqueue_event(grant_event(agent, "autonomy.stage.retire"))
        .await
        .expect("enqueue grant");
    assert_eq!(
        run_and_finish(&fx, &runtime, agent, T0 + 8 * hour).await,
        Stage::Retire
    );
    // Retire wraps back to discovery.
    assert_eq!(
        run_and_finish(&fx, &runtime, agent, T0 + 9 * hour).await,
        Stage::Discover
    );

    // The full walk is on the ledger with an intact digest chain.
    let agent_dir = runtime.store().agent_dir(agent);
    match verify_chain(&agent_dir).await {
        ChainStatus::Intact { entries } => assert!(entries > 10),
        ChainStatus::Broken { at, reason } => panic!("chain broken at {}: {}", at, reason),
    }
    let state = runtime.load_state(agent).await.expect("load");
    assert!(
        state.augmentation.active_experiments.is_empty(),
        "retire closes experiments"
    );
    assert!(
        state
            .augmentation
            .gaps
            .iter()
            .any(|g| g.status == crate::types::GapStatus::Addressed),
        "retired experiments close their source gaps"
    );
    assert!(state.augmentation.transitions.len() >= 9);
    for record in &state.augmentation.transitions {
        assert!(
            crate::phase::is_legal_transition(record.from, record.to),
            "observed transition {:?} -> {:?} must be legal",
            record.from,
            record.to
        );
    }
}

#[tokio::test]
async fn promote_gate_denial_freezes_the_stage() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "gated";

    // Craft a promote-stage state with healthy cycles and no verified
    // candidates at all.
    let mut state = runtime.load_state(agent).await.expect("load");
    state.augmentation.stage = Stage::Promote;
    state.augmentation.stage_entered_at = T0 - 3_600_000;
    for i in 0..3 {
        state.recent_cycles.push(crate::types::CycleRecord {
            started_at: T0 - (i + 1) * 60_000,
            finished_at: T0 - i * 60_000,
            duration_ms: 60_000,
            status: CycleStatus::Ok,
            summary: None,
            error: None,
            events_processed: 1,
            tokens_used: 10,
        });
    }
    runtime.store().save_state(&state).await.expect("save");

    let prepared = run_cycle(&fx, &runtime, agent, T0).await;
    assert_eq!(
        prepared.state.augmentation.stage,
        Stage::Promote,
        "gate failure freezes the stage"
    );
    let denial = prepared
        .events
        .iter()
        .find(|e| e.event_type == "autonomy.augmentation.policy.denied")
        .expect("denied event");
    let reason = denial.payload.as_ref().expect("payload")["reason"]
        .as_str()
        .expect("reason string")
        .to_string();
    assert!(
        reason.contains("no verified candidates"),
        "reason: {}",
        reason
    );
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;

    let ledger = runtime.read_ledger_entries(agent, 10, 0).await;
    let denied = ledger
        .iter()
        .find(|e| e.event_type == LedgerEventType::PolicyDenied)
        .expect("policy_denied ledger entry");
    assert!(denied.summary.contains("no verified candidates"));
}

#[tokio::test]
async fn crashed_save_recovers_from_backup_between_cycles() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "crashy";

    let prepared = run_cycle(&fx, &runtime, agent, T0).await;
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;
    let before = runtime.load_state(agent).await.expect("load");

    // Simulate a crash that corrupted the primary after the backup landed.
    let primary = runtime.store().agent_dir(agent).join("state.json");
    std::fs::write(&primary, "{\"version\": garbage").expect("corrupt");

    let recovered = runtime.load_state(agent).await.expect("load");
    assert_eq!(recovered.metrics.cycles, before.metrics.cycles);
    assert_eq!(recovered.budget, before.budget);

    // And the next cycle runs on the recovered document.
    let prepared = run_cycle(&fx, &runtime, agent, T0 + 3_600_000).await;
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;
    let after = runtime.load_state(agent).await.expect("load");
    assert_eq!(after.metrics.cycles, before.metrics.cycles + 1);
}

#[tokio::test]
async fn queue_dedupe_end_to_end_through_prepare() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "deduper";

    for _ in 0..3 {
        runtime
            .enqueue_event(fx.manual_event(agent, "task.created", Some("t-1")))
            .await
            .expect("enqueue");
    }
    for _ in 0..2 {
        runtime
            .enqueue_event(fx.manual_event(agent, "task.created", Some("t-2")))
            .await
            .expect("enqueue");
    }

    let prepared = run_cycle(&fx, &runtime, agent, 1_000_000).await;
    let admitted: Vec<&str> = prepared
        .events
        .iter()
        .filter(|e| e.event_type == "task.created")
        .filter_map(|e| e.dedupe_key.as_deref())
        .collect();
    assert_eq!(admitted, vec!["t-1", "t-2"]);
    assert_eq!(prepared.dropped_duplicates, 3);
    assert_eq!(prepared.remaining_events, 0);
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;
}

#[tokio::test]
async fn operator_reset_wipes_the_agent_directory() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "resettable";

    let prepared = run_cycle(&fx, &runtime, agent, T0).await;
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;
    assert!(runtime.has_state(agent).await);
    assert!(!runtime.read_ledger_entries(agent, 10, 0).await.is_empty());

    runtime.reset_runtime(agent).await.expect("reset");
    assert!(!runtime.has_state(agent).await);
    assert!(runtime.read_ledger_entries(agent, 10, 0).await.is_empty());

    // A fresh agent is born on the next load.
    let state = runtime.load_state(agent).await.expect("load");
    assert_eq!(state.metrics.cycles, 0);
    assert_eq!(state.augmentation.stage, Stage::Discover);
}

#[tokio::test]
async fn config_overrides_flow_through_prepare() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "tunable";

    let mut params = fx.prepare_params(agent, T0);
    params.overrides = Some(crate::config::ConfigOverrides {
        mission: Some("guard the release train".to_string()),
        max_actions_per_run: Some(2),
        ..crate::config::ConfigOverrides::default()
    });
    let prepared = match runtime.prepare(params).await.expect("prepare") {
        PrepareOutcome::Ready(prepared) => *prepared,
        PrepareOutcome::Skipped { reason, .. } => panic!("skipped: {}", reason),
    };
    assert_eq!(prepared.state.mission, "guard the release train");
    assert_eq!(prepared.state.max_actions_per_run, 2);
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;

    // Overrides persisted: the next plain load sees them.
    let state = runtime.load_state(agent).await.expect("load");
    assert_eq!(state.mission, "guard the release train");
    assert_eq!(state.max_actions_per_run, 2);
}

#[tokio::test]
async fn explicit_canary_regression_rolls_back_verified_candidates() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "canaried";

    // An agent sitting in canary with one verified candidate.
    let mut state = runtime.load_state(agent).await.expect("load");
    state.augmentation.stage = Stage::Canary;
    state.augmentation.stage_entered_at = T0 - 3_600_000;
    state.augmentation.candidates.push(crate::types::SkillCandidate {
        id: "cand-1".to_string(),
        source_gap_id: "gap-1".to_string(),
        name: "autonomy-cand-1".to_string(),
        intent: "Address gap: flaky webhooks".to_string(),
        status: CandidateStatus::Verified,
        priority: 50,
        created_at: T0 - 7_200_000,
        updated_at: T0 - 3_600_000,
        safety: crate::types::CandidateSafety {
            execution_class: crate::types::ExecutionClass::ReversibleWrite,
            constraints: vec!["Operate only inside the agent workspace".to_string()],
        },
        tests: vec!["Dry run succeeds on a representative input".to_string()],
    });
    runtime.store().save_state(&state).await.expect("save");

    let mut params = fx.prepare_params(agent, T0);
    params.canary = Some(crate::canary::CanaryInputs {
        error_rate: 0.9,
        max_error_rate: 0.2,
        latency_p95_ms: 100.0,
        baseline_latency_p95_ms: 100.0,
        max_latency_regression_pct: 25.0,
    });
    let prepared = match runtime.prepare(params).await.expect("prepare") {
        PrepareOutcome::Ready(prepared) => *prepared,
        PrepareOutcome::Skipped { reason, .. } => panic!("skipped: {}", reason),
    };

    assert_eq!(
        prepared.state.count_candidates(CandidateStatus::Verified),
        0,
        "regression demotes every verified candidate"
    );
    assert_eq!(prepared.state.count_candidates(CandidateStatus::Rejected), 1);
    // With nothing verified the canary stage falls back to discovery.
    assert_eq!(prepared.state.augmentation.stage, Stage::Discover);
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;

    let rollback = runtime
        .read_ledger_entries(agent, 20, 0)
        .await
        .into_iter()
        .find(|e| e.event_type == LedgerEventType::Rollback)
        .expect("rollback ledger entry");
    assert!(rollback.summary.contains("canary regression"));
}

#[tokio::test]
async fn max_queued_events_of_one_admits_one_per_cycle() {
    let fx = fixture(FixtureOptions::default()).await;
    let runtime = fx.runtime();
    let agent = "throttled";

    runtime
        .tune(
            agent,
            &crate::config::ConfigOverrides {
                max_queued_events: Some(1),
                ..crate::config::ConfigOverrides::default()
            },
            Some(T0),
        )
        .await
        .expect("tune");
    for i in 0..3 {
        runtime
            .enqueue_event(fx.manual_event(agent, "work.item", Some(&format!("w-{}", i))))
            .await
            .expect("enqueue");
    }

    let prepared = run_cycle(&fx, &runtime, agent, T0).await;
    let admitted = prepared
        .events
        .iter()
        .filter(|e| e.event_type == "work.item")
        .count();
    assert_eq!(admitted, 1, "exactly one admitted event per cycle");
    assert_eq!(prepared.remaining_events, 2, "the rest persist in the queue");
    fx.finish(&runtime, prepared, CycleStatus::Ok).await;
}

#[tokio::test]
async fn default_config_carries_no_budgets() {
    let config = AutonomyConfig::default();
    assert!(config.daily_cycle_budget.is_none());
    assert!(config.daily_token_budget.is_none());
    assert!(config.policy.destructive_requires_approval);
    assert!(!config.policy.reversible_writes_require_approval);
}
