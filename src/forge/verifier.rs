//! Candidate verifier: check generated documents against declarations.
//!
//! Only runs while the machine sits in the verify stage. Verification is
//! textual and strict: the document must carry the expected section headers
//! and every declared constraint and test, literally. Failures carry
//! machine-readable codes so hosts can triage without parsing prose.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::forge::skill_path;
use crate::types::{CandidateStatus, SkillCandidate};

/// Candidates verified per call.
const MAX_PER_CALL: usize = 5;

const REQUIRED_SECTIONS: [&str; 3] = [
    "## Purpose",
    "## Safety constraints",
    "## Verification checklist",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    ArtifactMissing,
    MissingSection,
    ConstraintMissing,
    TestMissing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationFailure {
    pub code: FailureCode,
    pub detail: String,
}

/// Per-candidate verification outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub candidate_id: String,
    pub name: String,
    pub passed: bool,
    pub failures: Vec<VerificationFailure>,
}

fn check_document(candidate: &SkillCandidate, content: &str) -> Vec<VerificationFailure> {
    let mut failures = Vec::new();

    for section in REQUIRED_SECTIONS {
        if !content.contains(section) {
            failures.push(VerificationFailure {
                code: FailureCode::MissingSection,
                detail: section.to_string(),
            });
        }
    }
    for constraint in &candidate.safety.constraints {
        if !content.contains(constraint.as_str()) {
            failures.push(VerificationFailure {
                code: FailureCode::ConstraintMissing,
                detail: constraint.clone(),
            });
        }
    }
    for test in &candidate.tests {
        if !content.contains(test.as_str()) {
            failures.push(VerificationFailure {
                code: FailureCode::TestMissing,
                detail: test.clone(),
            });
        }
    }
    failures
}

/// Verify up to [`MAX_PER_CALL`] planned candidates against their generated
/// documents. Each becomes verified on success or rejected on failure.
pub async fn verify_candidates(
    workspace_dir: &Path,
    candidates: &mut [SkillCandidate],
    now_ms: i64,
) -> anyhow::Result<Vec<VerificationReport>> {
    let mut reports = Vec::new();

    for candidate in candidates.iter_mut() {
        if reports.len() >= MAX_PER_CALL {
            break;
        }
        if candidate.status != CandidateStatus::Planned {
            continue;
        }

        let path = skill_path(workspace_dir, &candidate.name);
        let failures = match tokio::fs::read_to_string(&path).await {
            Ok(content) => check_document(candidate, &content),
            Err(_) => vec![VerificationFailure {
                code: FailureCode::ArtifactMissing,
                detail: path.display().to_string(),
            }],
        };

        let passed = failures.is_empty();
        candidate.status = if passed {
            CandidateStatus::Verified
        } else {
            CandidateStatus::Rejected
        };
        candidate.updated_at = now_ms;

        if passed {
            info!(candidate = %candidate.name, "candidate verified");
        } else {
            warn!(
                candidate = %candidate.name,
                failures = failures.len(),
                "candidate rejected by verifier"
            );
        }
        reports.push(VerificationReport {
            candidate_id: candidate.id.clone(),
            name: candidate.name.clone(),
            passed,
            failures,
        });
    }

    Ok(reports)
}
