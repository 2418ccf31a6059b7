//! Label records produced by the labeling round.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Skip, SkipReason};

// ---------------------------------------------------------------------------
// Label payload
// ---------------------------------------------------------------------------

/// Labeler-assigned confidence tag, ordered from most to least certain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Uncertainty {
    Low,
    Mid,
    High,
}

impl Uncertainty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "mid" => Some(Self::Mid),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Uncertainty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of the short-horizon operation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DslOp {
    /// Operator name from the op vocabulary.
    pub op: String,
    /// Operator arguments, shape checked against the vocabulary entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// A validated labeling response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelResult {
    /// Corrected goal, wrapped as `<|goal_start|>...<|goal_end|>`.
    pub goal: String,
    /// snake_case identifier of the immediate sub-goal.
    pub next_mid_step: String,
    pub short_goal_dsl: Vec<DslOp>,
    /// Frames (at 2FPS) the directive is expected to take.
    pub horizon_steps: u32,
    /// Evidence classes that mark the directive as done.
    pub done_evidence: Vec<String>,
    /// Fallback tags, in preference order.
    pub fallback_if_failed: Vec<String>,
    pub uncertainty: Uncertainty,
    /// Free-text rationale.
    pub attempt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid_step_id: Option<String>,
    /// The labeler saw the current plan as no longer viable.
    #[serde(default)]
    pub need_replan: bool,
}

impl LabelResult {
    /// Operator names in order; two labels with equal signatures share a plan.
    pub fn op_signature(&self) -> Vec<&str> {
        self.short_goal_dsl.iter().map(|op| op.op.as_str()).collect()
    }
}

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// Final state of one sample after the labeling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelStatus {
    /// Valid and usable for training.
    Accepted,
    /// Valid, but filtered out by policy (e.g. uncertainty threshold).
    Excluded,
    /// No valid label was obtained.
    Failed,
}

/// One line of `labels.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// `<episode>_t<anchor:06>`, unique across the dataset.
    pub sample_id: String,
    pub episode_id: String,
    /// Anchor frame index within the episode.
    pub anchor_t: usize,
    pub status: LabelStatus,
    /// Hex SHA-256 over the configured key parts.
    pub cache_key: String,
    /// Task identifier the label counts towards in coverage statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Present on accepted and excluded records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LabelResult>,
    /// Why the record is not accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<Skip>,
    /// First schema field that failed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_field: Option<String>,
    /// Network attempts made for this sample (0 on a cache hit).
    #[serde(default)]
    pub attempts: usize,
    /// Attempts that failed with a retryable error.
    #[serde(default)]
    pub transient_failures: usize,
    #[serde(default)]
    pub from_cache: bool,
}

impl LabelRecord {
    /// Accept or exclude a valid label against an uncertainty threshold.
    ///
    /// Failed records are left untouched.
    pub fn apply_uncertainty_threshold(&mut self, threshold: Option<Uncertainty>) {
        let Some(label) = &self.label else {
            return;
        };
        if self.status == LabelStatus::Failed {
            return;
        }
        if threshold.is_some_and(|t| label.uncertainty >= t) {
            self.status = LabelStatus::Excluded;
            self.skip = Some(Skip::new(
                SkipReason::HighUncertainty,
                format!("uncertainty {}", label.uncertainty),
            ));
        } else {
            self.status = LabelStatus::Accepted;
            self.skip = None;
        }
    }

    /// The label, only when it may be used for training.
    pub fn accepted(&self) -> Option<&LabelResult> {
        match self.status {
            LabelStatus::Accepted => self.label.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn label(ops: &[&str], evidence: &[&str], horizon: u32) -> LabelResult {
        LabelResult {
            goal: "<|goal_start|>clear the room<|goal_end|>".into(),
            next_mid_step: "clear_room".into(),
            short_goal_dsl: ops
                .iter()
                .map(|op| DslOp {
                    op: op.to_string(),
                    args: None,
                })
                .collect(),
            horizon_steps: horizon,
            done_evidence: evidence.iter().map(|e| e.to_string()).collect(),
            fallback_if_failed: vec!["retreat".into()],
            uncertainty: Uncertainty::Low,
            attempt: "enemy ahead, attack".into(),
            mid_step_id: None,
            need_replan: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncertainty_ordering() {
        assert!(Uncertainty::Low < Uncertainty::Mid);
        assert!(Uncertainty::Mid < Uncertainty::High);
        assert_eq!(Uncertainty::parse("mid"), Some(Uncertainty::Mid));
        assert_eq!(Uncertainty::parse("MID"), None);
    }

    #[test]
    fn test_accepted_only_when_status_accepted() {
        let mut record = LabelRecord {
            sample_id: "ep_t000120".into(),
            episode_id: "ep".into(),
            anchor_t: 120,
            status: LabelStatus::Excluded,
            cache_key: "k".into(),
            task_id: None,
            label: Some(fixtures::label(&["ATTACK"], &[], 4)),
            skip: None,
            invalid_field: None,
            attempts: 1,
            transient_failures: 0,
            from_cache: false,
        };
        assert!(record.accepted().is_none());
        record.status = LabelStatus::Accepted;
        assert!(record.accepted().is_some());
    }

    #[test]
    fn test_threshold_moves_records_both_ways() {
        let mut l = fixtures::label(&["ATTACK"], &[], 4);
        l.uncertainty = Uncertainty::Mid;
        let mut record = LabelRecord {
            sample_id: "ep_t000120".into(),
            episode_id: "ep".into(),
            anchor_t: 120,
            status: LabelStatus::Accepted,
            cache_key: "k".into(),
            task_id: None,
            label: Some(l),
            skip: None,
            invalid_field: None,
            attempts: 1,
            transient_failures: 0,
            from_cache: false,
        };

        record.apply_uncertainty_threshold(Some(Uncertainty::Mid));
        assert_eq!(record.status, LabelStatus::Excluded);
        assert_eq!(record.skip.as_ref().map(|s| s.reason), Some(SkipReason::HighUncertainty));

        record.apply_uncertainty_threshold(Some(Uncertainty::High));
        assert_eq!(record.status, LabelStatus::Accepted);
        assert!(record.skip.is_none());

        record.status = LabelStatus::Failed;
        record.apply_uncertainty_threshold(None);
        assert_eq!(record.status, LabelStatus::Failed);
    }
}
