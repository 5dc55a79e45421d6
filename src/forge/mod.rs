//! Skill Forge: the candidate lifecycle.
//!
//! The planner turns ranked gaps into skill candidates, the synthesizer
//! writes generated skill documents into the workspace, and the verifier
//! checks the generated artifacts against what each candidate declared.
//! Candidates move candidate -> planned -> verified | rejected; nothing
//! here ever executes a candidate.

use std::path::{Path, PathBuf};

use crate::utils::slug;

pub mod planner;
pub mod synthesizer;
pub mod verifier;

pub use planner::plan_candidates;
pub use synthesizer::{synthesize_candidates, SynthesisReport};
pub use verifier::{verify_candidates, FailureCode, VerificationFailure, VerificationReport};

/// Directory for generated skill documents, relative to the workspace.
pub const GENERATED_SKILLS_DIR: &str = "skills/autonomy-generated";

pub fn generated_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(GENERATED_SKILLS_DIR)
}

/// Path of one candidate's generated document.
pub fn skill_path(workspace_dir: &Path, candidate_name: &str) -> PathBuf {
    generated_dir(workspace_dir).join(format!("{}.md", slug(candidate_name)))
}
