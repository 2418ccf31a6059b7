//! Recoverable per-item outcomes.
//!
//! Nothing in the pipeline throws to skip a sample: every stage returns an
//! [`Outcome`], and the [`Skip`] half is folded into the build report.

use serde::{Deserialize, Serialize};

/// Reason code attached to every dropped segment, skipped sample, rejected
/// label, or discarded span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// The session directory could not be parsed.
    MalformedSession,
    /// A frame or action record is missing inside a segment.
    AlignmentGap,
    /// Segment annotations are malformed or overlap.
    InvalidSegments,
    /// The anchor does not sit inside any valid segment.
    OutsideSegment,
    /// A clip window cannot be fully resolved inside the anchor's segment.
    IncompleteWindow,
    /// A frame file could not be read while encoding media.
    MediaUnreadable,
    /// The labeling response failed shape or vocabulary validation.
    SchemaViolation,
    /// The labeling service kept failing after every retry.
    TransientServiceFailure,
    /// The labeling service refused the request outright.
    ServiceRejected,
    /// The label's uncertainty is at or above the exclusion threshold.
    HighUncertainty,
    /// No accepted label exists for the sample.
    MissingLabel,
    /// The sample has neither goal text nor a task segment.
    MissingGoal,
    /// The frame has no action record.
    MissingAction,
    /// The retrieval snapshot is empty and hits are required.
    MissingRetrieval,
    /// A new span would open before the previous one closed.
    SpanOverlap,
    /// The open span ran into a dropped frame.
    SpanGap,
    /// The episode ended with a span still open.
    UnclosedSpan,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedSession => "malformed-session",
            Self::AlignmentGap => "alignment-gap",
            Self::InvalidSegments => "invalid-segments",
            Self::OutsideSegment => "outside-segment",
            Self::IncompleteWindow => "incomplete-window",
            Self::MediaUnreadable => "media-unreadable",
            Self::SchemaViolation => "schema-violation",
            Self::TransientServiceFailure => "transient-service-failure",
            Self::ServiceRejected => "service-rejected",
            Self::HighUncertainty => "high-uncertainty",
            Self::MissingLabel => "missing-label",
            Self::MissingGoal => "missing-goal",
            Self::MissingAction => "missing-action",
            Self::MissingRetrieval => "missing-retrieval",
            Self::SpanOverlap => "span-overlap",
            Self::SpanGap => "span-gap",
            Self::UnclosedSpan => "unclosed-span",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured skip: the reason code plus a human-readable detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skip {
    pub reason: SkipReason,
    pub detail: String,
}

impl Skip {
    pub fn new(reason: SkipReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Skip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

/// Either a valid item or the reason it was skipped.
pub type Outcome<T> = std::result::Result<T, Skip>;
