//! Planner training records.
//!
//! Built from the history windows of a sample, its goal text, its accepted
//! label and its retrieval snapshot. Lookahead windows never reach this
//! record.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::clip::{ClipSample, Window};
use crate::error::{Outcome, Skip, SkipReason};
use crate::label::{DslOp, LabelResult, Uncertainty};
use crate::retrieval::RetrievalSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerInput {
    pub recent_clip: Window,
    pub summary_clip: Window,
    pub goal: String,
    pub labeling_instruct: String,
    pub retrieved_memory: RetrievalSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerTarget {
    pub goal: String,
    pub next_mid_step: String,
    pub short_goal_dsl: Vec<DslOp>,
    pub horizon_steps: u32,
    pub done_evidence: Vec<String>,
    pub fallback_if_failed: Vec<String>,
    pub uncertainty: Uncertainty,
    pub attempt: String,
}

/// One line of `planner.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerRecord {
    pub schema_version: String,
    pub sample_id: String,
    pub episode_id: String,
    pub anchor_t: usize,
    pub plan_id: String,
    pub frames_root: PathBuf,
    pub input: PlannerInput,
    pub target: PlannerTarget,
}

/// Assemble a planner record, or say which input is missing.
///
/// Incomplete samples are skipped, never padded with defaults.
pub fn build_planner_record(
    sample: &ClipSample,
    label: Option<&LabelResult>,
    plan_id: Option<&str>,
    snapshot: RetrievalSnapshot,
    schema_version: &str,
) -> Outcome<PlannerRecord> {
    let history = &sample.history;
    if history.near_past.is_empty() || history.long_past.is_empty() {
        return Err(Skip::new(
            SkipReason::IncompleteWindow,
            format!("{}: empty history window", sample.sample_id),
        ));
    }
    let goal = sample.goal_text().ok_or_else(|| {
        Skip::new(
            SkipReason::MissingGoal,
            format!("{}: no goal or task text", sample.sample_id),
        )
    })?;
    let (label, plan_id) = label.zip(plan_id).ok_or_else(|| {
        Skip::new(
            SkipReason::MissingLabel,
            format!("{}: no accepted label", sample.sample_id),
        )
    })?;

    Ok(PlannerRecord {
        schema_version: schema_version.to_string(),
        sample_id: sample.sample_id.clone(),
        episode_id: sample.episode_id.clone(),
        anchor_t: sample.anchor,
        plan_id: plan_id.to_string(),
        frames_root: sample.frames_root.clone(),
        input: PlannerInput {
            recent_clip: history.near_past.clone(),
            summary_clip: history.long_past.clone(),
            goal: goal.to_string(),
            labeling_instruct: sample.instruct.clone().unwrap_or_default(),
            retrieved_memory: snapshot,
        },
        target: PlannerTarget {
            goal: label.goal.clone(),
            next_mid_step: label.next_mid_step.clone(),
            short_goal_dsl: label.short_goal_dsl.clone(),
            horizon_steps: label.horizon_steps,
            done_evidence: label.done_evidence.clone(),
            fallback_if_failed: label.fallback_if_failed.clone(),
            uncertainty: label.uncertainty,
            attempt: label.attempt.clone(),
        },
    })
}
