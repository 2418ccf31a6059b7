//! Controller training records: one per frame of every closed span.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Skip, SkipReason};
use crate::label::DslOp;
use crate::session::{EpisodeAlignment, Session};
use crate::span::PlanSpan;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerInput {
    pub image_t: String,
    /// Preceding frames of the same segment, oldest first.
    pub history: Vec<String>,
    pub short_goal_dsl: Vec<DslOp>,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerTarget {
    pub action_t: String,
}

/// One line of `controller.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub schema_version: String,
    pub episode_id: String,
    pub frame_t: usize,
    pub frames_root: PathBuf,
    pub input: ControllerInput,
    pub target: ControllerTarget,
}

/// Frame-level records of one span. Frames without an aligned action are
/// reported instead of emitted.
pub fn build_controller_records(
    session: &Session,
    alignment: &EpisodeAlignment,
    span: &PlanSpan,
    history_frames: usize,
    schema_version: &str,
) -> (Vec<ControllerRecord>, Vec<Skip>) {
    let mut records = Vec::with_capacity(span.frame_count());
    let mut skipped = Vec::new();
    let segment_start = alignment
        .segment_of(span.t0)
        .map_or(span.t0, |s| s.segment.start);

    for frame in span.frames() {
        let (Some(image), Some(action)) = (session.relative_frame(frame), session.action(frame))
        else {
            skipped.push(Skip::new(
                SkipReason::MissingAction,
                format!("{} frame {frame} has no aligned action", session.episode_id),
            ));
            continue;
        };

        let history = (frame.saturating_sub(history_frames).max(segment_start)..frame)
            .filter_map(|i| session.relative_frame(i))
            .collect();

        records.push(ControllerRecord {
            schema_version: schema_version.to_string(),
            episode_id: session.episode_id.clone(),
            frame_t: frame,
            frames_root: session.frames_root.clone(),
            input: ControllerInput {
                image_t: image,
                history,
                short_goal_dsl: span.short_goal_dsl.clone(),
                plan_id: span.plan_id.clone(),
            },
            target: ControllerTarget {
                action_t: action.to_string(),
            },
        });
    }
    (records, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlignerConfig;
    use crate::session::types::fixtures::aligned_session;
    use crate::session::FrameActionAligner;
    use crate::span::CloseReason;

    fn span(t0: usize, t_end: usize) -> PlanSpan {
        PlanSpan {
            plan_id: "ep_p000002".into(),
            episode_id: "ep".into(),
            t0,
            t_end,
            close_reason: CloseReason::Horizon,
            short_goal_dsl: vec![DslOp {
                op: "ATTACK".into(),
                args: None,
            }],
            horizon_steps: 4,
        }
    }

    #[test]
    fn test_one_record_per_span_frame() {
        let session = aligned_session("ep", 20);
        let alignment = FrameActionAligner::new(AlignerConfig::default()).align(&session);

        let (records, skipped) = build_controller_records(&session, &alignment, &span(2, 5), 7, "v1");
        assert!(skipped.is_empty());
        let frames: Vec<usize> = records.iter().map(|r| r.frame_t).collect();
        assert_eq!(frames, vec![2, 3, 4, 5]);
        assert!(records.iter().all(|r| r.input.plan_id == "ep_p000002"));

        assert_eq!(records[0].input.image_t, "000003.jpg");
        assert_eq!(records[0].target.action_t, "act_2");
        // History never reaches before the segment start.
        assert_eq!(records[0].input.history, vec!["000001.jpg", "000002.jpg"]);
        assert_eq!(records[3].input.history.len(), 5);
    }
}
