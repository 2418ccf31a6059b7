//! Plan spans: contiguous runs of frames governed by one short-horizon
//! directive.
//!
//! [`PlanSpanAligner`] walks an episode, assigns plan ids to labeled anchors
//! and drives a [`SpanMachine`] that decides where each span closes.

pub mod machine;
pub mod plan;

pub use machine::{
    CloseReason, Directive, EvidenceSignal, FrameObservation, PlanSpan, SpanEvent, SpanMachine,
    SpanRejection,
};
pub use plan::{EpisodeSpans, PlanSpanAligner};
