//! Policy runtime: allow/deny decisions by execution class.
//!
//! Fail-closed: any ambiguity about approvals or class resolves to a denial
//! with a recorded reason, never a silent allow. Operator approvals are
//! granted through queue events, carry a TTL, and are consumed on use.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{AgentState, Approval, ExecutionClass};

/// Default operator-approval lifetime.
pub const APPROVAL_TTL_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub policy_version: u32,
    pub allowed_actions: Vec<String>,
    pub denied_actions: Vec<String>,
    pub destructive_requires_approval: bool,
    pub reversible_writes_require_approval: bool,
    pub approval_ttl_ms: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_version: 1,
            allowed_actions: Vec::new(),
            denied_actions: Vec::new(),
            destructive_requires_approval: true,
            reversible_writes_require_approval: false,
            approval_ttl_ms: APPROVAL_TTL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalLevel {
    NotRequired,
    OperatorRequired,
}

/// The decision record returned to callers and written into denial audits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub approval_level: ApprovalLevel,
    pub policy_version: u32,
    pub execution_class: ExecutionClass,
}

impl PolicyDecision {
    fn allow(reason: &str, level: ApprovalLevel, config: &PolicyConfig, class: ExecutionClass) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
            approval_level: level,
            policy_version: config.policy_version,
            execution_class: class,
        }
    }

    fn deny(reason: &str, level: ApprovalLevel, config: &PolicyConfig, class: ExecutionClass) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
            approval_level: level,
            policy_version: config.policy_version,
            execution_class: class,
        }
    }
}

/// Evaluate an action. Rules in order, first match wins:
/// 1. explicit deny list
/// 2. explicit allow list, read-only class only
/// 3. destructive without approval when approval is required
/// 4. reversible write without approval when approval is required
/// 5. allow
pub fn evaluate(
    action: &str,
    class: ExecutionClass,
    config: &PolicyConfig,
    approved_by_operator: bool,
) -> PolicyDecision {
    let action = action.trim();

    if config.denied_actions.iter().any(|denied| denied == action) {
        return PolicyDecision::deny(
            "action is on the explicit deny list",
            ApprovalLevel::NotRequired,
            config,
            class,
        );
    }

    if class == ExecutionClass::ReadOnly
        && config.allowed_actions.iter().any(|allowed| allowed == action)
    {
        return PolicyDecision::allow(
            "read-only action on the explicit allow list",
            ApprovalLevel::NotRequired,
            config,
            class,
        );
    }

    if class == ExecutionClass::Destructive
        && config.destructive_requires_approval
        && !approved_by_operator
    {
        return PolicyDecision::deny(
            "destructive action requires operator approval",
            ApprovalLevel::OperatorRequired,
            config,
            class,
        );
    }

    if class == ExecutionClass::ReversibleWrite
        && config.reversible_writes_require_approval
        && !approved_by_operator
    {
        return PolicyDecision::deny(
            "reversible write requires operator approval",
            ApprovalLevel::OperatorRequired,
            config,
            class,
        );
    }

    PolicyDecision::allow("no policy rule matched", ApprovalLevel::NotRequired, config, class)
}

/// Record a granted approval against the state.
pub fn grant_approval(
    state: &mut AgentState,
    action: &str,
    source: &str,
    config: &PolicyConfig,
    now_ms: i64,
) {
    let action = action.trim().to_string();
    if action.is_empty() {
        return;
    }
    debug!(action = %action, source = %source, "operator approval granted");
    state.approvals.insert(
        action.clone(),
        Approval {
            action,
            approved_at: now_ms,
            expires_at: now_ms + config.approval_ttl_ms.max(0),
            source: source.trim().to_string(),
        },
    );
}

/// True when an unexpired approval exists for the action.
pub fn has_live_approval(state: &AgentState, action: &str, now_ms: i64) -> bool {
    state
        .approvals
        .get(action.trim())
        .is_some_and(|approval| approval.expires_at > now_ms)
}

/// Consume (remove) an approval after use. Returns the spent approval.
pub fn consume_approval(state: &mut AgentState, action: &str) -> Option<Approval> {
    state.approvals.remove(action.trim())
}
