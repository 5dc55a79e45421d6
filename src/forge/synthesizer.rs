//! Skill synthesizer: write generated skill documents into the workspace.
//!
//! Only runs while the machine sits in the synthesize stage. Writes are
//! atomic (temp file + rename) and idempotent: an unchanged candidate and
//! an unchanged file mean no write at all.

use std::path::Path;

use tracing::info;

use crate::forge::skill_path;
use crate::types::{CandidateStatus, SkillCandidate};

/// Candidates synthesized per call.
const MAX_PER_CALL: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    /// Candidate ids marked planned this call.
    pub synthesized: Vec<String>,
    /// Files actually written (idempotent repeats are skipped).
    pub files_written: Vec<String>,
}

/// Render one candidate's skill document.
pub fn render_skill_document(candidate: &SkillCandidate) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("# {}\n\n", candidate.name));

    doc.push_str("## Purpose\n\n");
    doc.push_str(candidate.intent.trim());
    doc.push_str("\n\n");

    doc.push_str("## Safety constraints\n\n");
    for constraint in &candidate.safety.constraints {
        doc.push_str(&format!("- {}\n", constraint));
    }
    doc.push('\n');

    doc.push_str("## Verification checklist\n\n");
    for test in &candidate.tests {
        doc.push_str(&format!("- [ ] {}\n", test));
    }
    doc.push('\n');

    doc.push_str("## Operational guidance\n\n");
    doc.push_str(
        "Run this skill only from the agent workspace. Stop on the first \
         failed check, leave partial artifacts in place for inspection, and \
         report the failure through the normal event queue.\n",
    );
    doc
}

async fn write_if_changed(path: &Path, content: &str) -> anyhow::Result<bool> {
    if let Ok(existing) = tokio::fs::read_to_string(path).await {
        if existing == content {
            return Ok(false);
        }
    }
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("skill path has no parent: {}", path.display()))?;
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("skill"),
        std::process::id()
    ));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(true)
}

/// Synthesize up to [`MAX_PER_CALL`] candidate or planned entries: write
/// their documents and mark them planned with a fresh `updatedAt`.
pub async fn synthesize_candidates(
    workspace_dir: &Path,
    candidates: &mut [SkillCandidate],
    now_ms: i64,
) -> anyhow::Result<SynthesisReport> {
    let mut report = SynthesisReport::default();

    for candidate in candidates.iter_mut() {
        if report.synthesized.len() >= MAX_PER_CALL {
            break;
        }
        if !matches!(
            candidate.status,
            CandidateStatus::Candidate | CandidateStatus::Planned
        ) {
            continue;
        }

        let path = skill_path(workspace_dir, &candidate.name);
        let content = render_skill_document(candidate);
        let written = write_if_changed(&path, &content).await?;
        if written {
            info!(candidate = %candidate.name, path = %path.display(), "synthesized skill document");
            report.files_written.push(path.display().to_string());
        }

        candidate.status = CandidateStatus::Planned;
        candidate.updated_at = now_ms;
        report.synthesized.push(candidate.id.clone());
    }

    Ok(report)
}
