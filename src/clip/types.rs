use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::window::{HistoryWindows, LookaheadWindows};
use crate::error::Skip;

/// One anchor's four windows, the anchor's action, and its text context.
///
/// Serialized as one line of `clip_index.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSample {
    pub sample_id: String,
    pub episode_id: String,
    #[serde(rename = "anchor_t")]
    pub anchor: usize,
    /// Directory the window frame paths are relative to.
    pub frames_root: PathBuf,
    #[serde(flatten)]
    pub history: HistoryWindows,
    #[serde(flatten)]
    pub lookahead: LookaheadWindows,
    #[serde(rename = "action_t")]
    pub action: String,
    #[serde(rename = "goal_t", default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(rename = "instruct_t", default, skip_serializing_if = "Option::is_none")]
    pub instruct: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "mid_step_id", default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(rename = "mid_step_text", default, skip_serializing_if = "Option::is_none")]
    pub step_text: Option<String>,
}

impl ClipSample {
    /// Sample identifier for an anchor: `<episode>_t<anchor:06>`.
    pub fn make_id(episode_id: &str, anchor: usize) -> String {
        format!("{episode_id}_t{anchor:06}")
    }

    /// Task identifier used for retrieval and coverage: the episode task, or
    /// the segment step id when the episode has none.
    pub fn task_key(&self) -> Option<&str> {
        self.task_id.as_deref().or(self.step_id.as_deref())
    }

    /// Goal text for planner input: explicit goal, else the segment text.
    pub fn goal_text(&self) -> Option<&str> {
        self.goal
            .as_deref()
            .or(self.step_text.as_deref())
            .filter(|g| !g.trim().is_empty())
    }
}

/// An anchor that did not produce a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSkip {
    pub sample_id: String,
    pub anchor: usize,
    pub skip: Skip,
}

/// Everything the sampler produced for one episode.
#[derive(Debug, Clone, Default)]
pub struct EpisodeSamples {
    pub episode_id: String,
    pub samples: Vec<ClipSample>,
    pub skipped: Vec<SampleSkip>,
}
