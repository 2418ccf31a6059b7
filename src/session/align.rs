//! Frame-action alignment.
//!
//! Correspondence is positional only: frame `i` pairs with action `i`, and no
//! timestamps are reconciled. A segment with any unpaired index is dropped
//! whole (or the whole episode, under [`GapPolicy::DropEpisode`]); nothing is
//! ever partially repaired.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{Segment, Session};
use crate::config::{AlignerConfig, GapPolicy};
use crate::error::{Skip, SkipReason};

/// A segment whose every index has both a frame and an action record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedSegment {
    /// Position of the segment once sorted by start frame.
    pub segment_index: usize,
    pub segment: Segment,
}

/// A segment rejected by the aligner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDrop {
    pub segment_index: usize,
    pub start: usize,
    pub end: usize,
    pub skip: Skip,
}

/// Per-episode result of alignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeAlignment {
    pub episode_id: String,
    pub valid: Vec<AlignedSegment>,
    pub dropped: Vec<SegmentDrop>,
    /// Set when the whole episode was dropped.
    pub episode_drop: Option<Skip>,
}

impl EpisodeAlignment {
    /// The valid segment containing `index`, if any.
    pub fn segment_of(&self, index: usize) -> Option<&AlignedSegment> {
        self.valid.iter().find(|s| s.segment.contains(index))
    }

    /// Whether `index` lies in a valid segment.
    pub fn is_valid_frame(&self, index: usize) -> bool {
        self.segment_of(index).is_some()
    }

    /// Every valid frame index, ascending.
    pub fn valid_frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.valid
            .iter()
            .flat_map(|s| s.segment.start..=s.segment.end)
    }

    pub fn valid_frame_count(&self) -> usize {
        self.valid.iter().map(|s| s.segment.frame_count()).sum()
    }
}

/// Validates segments of a session against its frame and action streams.
#[derive(Debug, Clone)]
pub struct FrameActionAligner {
    config: AlignerConfig,
}

impl FrameActionAligner {
    pub fn new(config: AlignerConfig) -> Self {
        Self { config }
    }

    /// Align one session. Pure function of the session and configuration.
    pub fn align(&self, session: &Session) -> EpisodeAlignment {
        let episode_id = session.episode_id.clone();
        let mut segments = session.effective_segments();
        segments.sort_by_key(|s| (s.start, s.end));

        if let Err(skip) = check_segments(&segments) {
            warn!(episode = %episode_id, reason = %skip.reason, detail = %skip.detail, "Dropping episode");
            return EpisodeAlignment {
                episode_id,
                episode_drop: Some(skip),
                ..Default::default()
            };
        }

        let mut valid = Vec::new();
        let mut dropped = Vec::new();

        for (segment_index, segment) in segments.into_iter().enumerate() {
            match session.first_gap(segment.start, segment.end) {
                None => valid.push(AlignedSegment {
                    segment_index,
                    segment,
                }),
                Some(gap) => {
                    let what = missing_counterpart(session, gap);
                    let skip = Skip::new(
                        SkipReason::AlignmentGap,
                        format!("index {gap} has no {what}"),
                    );
                    warn!(
                        episode = %episode_id,
                        segment_index,
                        start = segment.start,
                        end = segment.end,
                        gap,
                        missing = what,
                        "Dropping segment with alignment gap"
                    );
                    dropped.push(SegmentDrop {
                        segment_index,
                        start: segment.start,
                        end: segment.end,
                        skip,
                    });
                }
            }
        }

        if self.config.gap_policy == GapPolicy::DropEpisode && !dropped.is_empty() {
            let skip = Skip::new(
                SkipReason::AlignmentGap,
                format!("{} segment(s) with gaps", dropped.len()),
            );
            warn!(episode = %episode_id, "Dropping episode under drop_episode gap policy");
            for seg in valid.drain(..) {
                dropped.push(SegmentDrop {
                    segment_index: seg.segment_index,
                    start: seg.segment.start,
                    end: seg.segment.end,
                    skip: skip.clone(),
                });
            }
            dropped.sort_by_key(|d| d.segment_index);
            return EpisodeAlignment {
                episode_id,
                valid,
                dropped,
                episode_drop: Some(skip),
            };
        }

        debug!(
            episode = %episode_id,
            valid = valid.len(),
            dropped = dropped.len(),
            "Aligned episode"
        );

        EpisodeAlignment {
            episode_id,
            valid,
            dropped,
            episode_drop: None,
        }
    }
}

/// Reject reversed or overlapping segment annotations.
fn check_segments(sorted: &[Segment]) -> Result<(), Skip> {
    if sorted.is_empty() {
        return Err(Skip::new(SkipReason::InvalidSegments, "episode has no frames"));
    }
    for seg in sorted {
        if seg.end < seg.start {
            return Err(Skip::new(
                SkipReason::InvalidSegments,
                format!("segment {}..{} ends before it starts", seg.start, seg.end),
            ));
        }
    }
    for pair in sorted.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(Skip::new(
                SkipReason::InvalidSegments,
                format!(
                    "segments {}..{} and {}..{} overlap",
                    pair[0].start, pair[0].end, pair[1].start, pair[1].end
                ),
            ));
        }
    }
    Ok(())
}

fn missing_counterpart(session: &Session, index: usize) -> &'static str {
    match (session.frame_path(index).is_some(), session.action(index).is_some()) {
        (false, false) => "frame or action",
        (false, true) => "frame",
        _ => "action",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::fixtures::aligned_session;

    fn aligner(policy: GapPolicy) -> FrameActionAligner {
        FrameActionAligner::new(AlignerConfig {
            gap_policy: policy,
            frame_index_base: 1,
        })
    }

    #[test]
    fn test_fully_aligned_episode() {
        let session = aligned_session("ep", 50);
        let result = aligner(GapPolicy::DropSegment).align(&session);
        assert_eq!(result.valid.len(), 1);
        assert!(result.dropped.is_empty());
        assert_eq!(result.valid_frame_count(), 50);
    }

    #[test]
    fn test_gap_drops_only_its_segment() {
        let mut session = aligned_session("ep", 30);
        session.segments = vec![Segment::new(0, 9), Segment::new(10, 19), Segment::new(20, 29)];
        session.actions[15] = None;

        let result = aligner(GapPolicy::DropSegment).align(&session);
        assert_eq!(result.valid.len(), 2);
        assert_eq!(result.dropped.len(), 1);
        assert_eq!(result.dropped[0].start, 10);
        assert_eq!(result.dropped[0].skip.reason, SkipReason::AlignmentGap);
        assert!(result.dropped[0].skip.detail.contains("action"));
        assert!(!result.is_valid_frame(12));
        assert!(result.is_valid_frame(25));
    }

    #[test]
    fn test_gap_drops_episode_when_configured() {
        let mut session = aligned_session("ep", 30);
        session.segments = vec![Segment::new(0, 9), Segment::new(10, 29)];
        session.frames[3] = None;

        let result = aligner(GapPolicy::DropEpisode).align(&session);
        assert!(result.valid.is_empty());
        assert_eq!(result.dropped.len(), 2);
        assert_eq!(
            result.episode_drop.as_ref().map(|s| s.reason),
            Some(SkipReason::AlignmentGap)
        );
    }

    #[test]
    fn test_segment_index_follows_start_order() {
        let mut session = aligned_session("ep", 30);
        session.segments = vec![Segment::new(20, 29), Segment::new(0, 9), Segment::new(10, 19)];

        let result = aligner(GapPolicy::DropSegment).align(&session);
        let indexed: Vec<(usize, usize)> = result
            .valid
            .iter()
            .map(|s| (s.segment_index, s.segment.start))
            .collect();
        assert_eq!(indexed, vec![(0, 0), (1, 10), (2, 20)]);
        assert_eq!(result.segment_of(25).map(|s| s.segment_index), Some(2));
    }

    #[test]
    fn test_segment_past_end_of_stream() {
        let mut session = aligned_session("ep", 10);
        session.segments = vec![Segment::new(0, 14)];
        let result = aligner(GapPolicy::DropSegment).align(&session);
        assert!(result.valid.is_empty());
        assert!(result.dropped[0].skip.detail.contains("index 10"));
    }

    #[test]
    fn test_overlapping_segments_drop_episode() {
        let mut session = aligned_session("ep", 20);
        session.segments = vec![Segment::new(0, 10), Segment::new(10, 19)];
        let result = aligner(GapPolicy::DropSegment).align(&session);
        assert_eq!(
            result.episode_drop.map(|s| s.reason),
            Some(SkipReason::InvalidSegments)
        );
    }

    #[test]
    fn test_alignment_is_idempotent() {
        let mut session = aligned_session("ep", 40);
        session.frames[7] = None;
        session.segments = vec![Segment::new(0, 19), Segment::new(20, 39)];
        let a = aligner(GapPolicy::DropSegment);
        assert_eq!(a.align(&session), a.align(&session));
    }
}
