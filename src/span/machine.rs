//! The per-episode plan-span state machine.
//!
//! Frames are fed strictly in index order. While a span is open, each frame
//! is checked against the close conditions in priority order:
//!
//! 1. stable completion evidence
//! 2. an explicit replan signal
//! 3. a strong interrupt event
//! 4. horizon exhausted
//!
//! The first condition that holds closes the span on that frame, inclusive.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SpanConfig;
use crate::error::{Skip, SkipReason};
use crate::label::DslOp;

/// Why a span closed. Declaration order is the evaluation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    Evidence,
    Replan,
    Interrupt,
    Horizon,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evidence => "evidence",
            Self::Replan => "replan",
            Self::Interrupt => "interrupt",
            Self::Horizon => "horizon",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A short-horizon directive introduced by a labeled anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub plan_id: String,
    pub short_goal_dsl: Vec<DslOp>,
    pub horizon_steps: u32,
    /// Evidence tags that count towards completing this directive.
    pub done_evidence: Vec<String>,
}

/// An evidence tag seen at a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSignal {
    pub tag: String,
    pub confidence: f64,
}

/// Everything the machine needs to know about one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameObservation {
    pub frame: usize,
    /// False for frames outside every valid segment.
    pub valid: bool,
    /// Segment the frame belongs to; spans never cross segments.
    pub segment: usize,
    pub directive: Option<Directive>,
    pub evidence: Vec<EvidenceSignal>,
    pub need_replan: bool,
    pub events: Vec<String>,
}

impl FrameObservation {
    pub fn new(frame: usize) -> Self {
        Self {
            frame,
            valid: true,
            ..Self::default()
        }
    }
}

/// A closed span: frames `t0..=t_end` governed by one directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSpan {
    pub plan_id: String,
    pub episode_id: String,
    pub t0: usize,
    pub t_end: usize,
    pub close_reason: CloseReason,
    pub short_goal_dsl: Vec<DslOp>,
    pub horizon_steps: u32,
}

impl PlanSpan {
    pub fn frame_count(&self) -> usize {
        self.t_end - self.t0 + 1
    }

    pub fn contains(&self, frame: usize) -> bool {
        (self.t0..=self.t_end).contains(&frame)
    }

    pub fn frames(&self) -> std::ops::RangeInclusive<usize> {
        self.t0..=self.t_end
    }
}

/// A plan that did not produce a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRejection {
    pub plan_id: String,
    pub frame: usize,
    pub skip: Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpanEvent {
    Closed(PlanSpan),
    Rejected(SpanRejection),
}

#[derive(Debug)]
struct OpenSpan {
    directive: Directive,
    t0: usize,
    stable_tags: BTreeSet<String>,
    stable_run: usize,
}

#[derive(Debug)]
enum SpanState {
    Idle,
    Open(OpenSpan),
}

pub struct SpanMachine {
    episode_id: String,
    stable_frames: usize,
    min_confidence: f64,
    strong_interrupts: HashSet<String>,
    state: SpanState,
    last_frame: Option<(usize, usize)>,
    /// Plans that opened a span or were rejected; none of them opens again.
    used_plans: HashSet<String>,
}

impl SpanMachine {
    pub fn new(episode_id: impl Into<String>, config: &SpanConfig) -> Self {
        Self {
            episode_id: episode_id.into(),
            stable_frames: config.stable_frames.max(1),
            min_confidence: config.min_evidence_confidence,
            strong_interrupts: config.strong_interrupts.iter().cloned().collect(),
            state: SpanState::Idle,
            last_frame: None,
            used_plans: HashSet::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SpanState::Open(_))
    }

    /// Plan id of the open span, if any.
    pub fn open_plan(&self) -> Option<&str> {
        match &self.state {
            SpanState::Open(open) => Some(&open.directive.plan_id),
            SpanState::Idle => None,
        }
    }

    /// Advance by one frame. Frames must arrive in increasing index order.
    pub fn step(&mut self, mut obs: FrameObservation) -> Vec<SpanEvent> {
        let mut events = Vec::new();
        let contiguous = self
            .last_frame
            .map_or(true, |(frame, segment)| obs.frame == frame + 1 && obs.segment == segment);
        self.last_frame = Some((obs.frame, obs.segment));

        if !obs.valid || !contiguous {
            if let SpanState::Open(open) = std::mem::replace(&mut self.state, SpanState::Idle) {
                events.push(self.reject(
                    &open.directive.plan_id,
                    obs.frame,
                    SkipReason::SpanGap,
                    format!("span opened at {} cannot continue at frame {}", open.t0, obs.frame),
                ));
            }
            if !obs.valid {
                return events;
            }
        }

        if let Some(directive) = obs.directive.take() {
            self.offer(directive, obs.frame, &mut events);
        }

        if let SpanState::Open(open) = &mut self.state {
            let reason = close_reason(
                open,
                obs.frame,
                &obs,
                self.stable_frames,
                self.min_confidence,
                &self.strong_interrupts,
            );
            if let Some(reason) = reason {
                if let SpanState::Open(open) = std::mem::replace(&mut self.state, SpanState::Idle) {
                    let span = PlanSpan {
                        plan_id: open.directive.plan_id,
                        episode_id: self.episode_id.clone(),
                        t0: open.t0,
                        t_end: obs.frame,
                        close_reason: reason,
                        short_goal_dsl: open.directive.short_goal_dsl,
                        horizon_steps: open.directive.horizon_steps,
                    };
                    debug!(
                        plan_id = %span.plan_id,
                        t0 = span.t0,
                        t_end = span.t_end,
                        reason = %reason,
                        "Span closed"
                    );
                    events.push(SpanEvent::Closed(span));
                }
            }
        }
        events
    }

    /// End of episode: a span still open is discarded.
    pub fn finish(mut self) -> Vec<SpanEvent> {
        match std::mem::replace(&mut self.state, SpanState::Idle) {
            SpanState::Open(open) => {
                let frame = self.last_frame.map_or(open.t0, |(frame, _)| frame);
                vec![self.reject(
                    &open.directive.plan_id,
                    frame,
                    SkipReason::UnclosedSpan,
                    format!("span opened at {} still open at episode end", open.t0),
                )]
            }
            SpanState::Idle => Vec::new(),
        }
    }

    fn offer(&mut self, directive: Directive, frame: usize, events: &mut Vec<SpanEvent>) {
        let open = match &self.state {
            SpanState::Open(open) => Some((open.directive.plan_id.clone(), open.t0)),
            SpanState::Idle => None,
        };
        match open {
            Some((open_id, _)) if open_id == directive.plan_id => {}
            _ if self.used_plans.contains(&directive.plan_id) => {}
            Some((open_id, t0)) => {
                let detail = format!(
                    "plan {} at frame {frame} while {open_id} is open since {t0}",
                    directive.plan_id
                );
                events.push(self.reject(
                    &directive.plan_id,
                    frame,
                    SkipReason::SpanOverlap,
                    detail,
                ));
            }
            None => {
                self.used_plans.insert(directive.plan_id.clone());
                debug!(plan_id = %directive.plan_id, t0 = frame, "Span opened");
                self.state = SpanState::Open(OpenSpan {
                    directive,
                    t0: frame,
                    stable_tags: BTreeSet::new(),
                    stable_run: 0,
                });
            }
        }
    }

    fn reject(&mut self, plan_id: &str, frame: usize, reason: SkipReason, detail: String) -> SpanEvent {
        warn!(
            episode_id = %self.episode_id,
            plan_id,
            frame,
            reason = %reason,
            "{detail}"
        );
        self.used_plans.insert(plan_id.to_string());
        SpanEvent::Rejected(SpanRejection {
            plan_id: plan_id.to_string(),
            frame,
            skip: Skip::new(reason, detail),
        })
    }
}

/// Update the evidence run of `open` with this frame, then return the first
/// close condition that holds.
fn close_reason(
    open: &mut OpenSpan,
    frame: usize,
    obs: &FrameObservation,
    stable_frames: usize,
    min_confidence: f64,
    strong_interrupts: &HashSet<String>,
) -> Option<CloseReason> {
    let tags: BTreeSet<String> = obs
        .evidence
        .iter()
        .filter(|e| e.confidence >= min_confidence)
        .filter(|e| open.directive.done_evidence.contains(&e.tag))
        .map(|e| e.tag.clone())
        .collect();
    if tags.is_empty() {
        open.stable_tags.clear();
        open.stable_run = 0;
    } else if tags == open.stable_tags {
        open.stable_run += 1;
    } else {
        open.stable_tags = tags;
        open.stable_run = 1;
    }

    if open.stable_run >= stable_frames {
        Some(CloseReason::Evidence)
    } else if obs.need_replan {
        Some(CloseReason::Replan)
    } else if obs.events.iter().any(|e| strong_interrupts.contains(e)) {
        Some(CloseReason::Interrupt)
    } else if frame + 1 - open.t0 >= open.directive.horizon_steps as usize {
        Some(CloseReason::Horizon)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(plan_id: &str, horizon: u32) -> Directive {
        Directive {
            plan_id: plan_id.into(),
            short_goal_dsl: vec![DslOp {
                op: "ATTACK".into(),
                args: None,
            }],
            horizon_steps: horizon,
            done_evidence: vec!["enemy_dead".into()],
        }
    }

    fn evidence(tag: &str, confidence: f64) -> EvidenceSignal {
        EvidenceSignal {
            tag: tag.into(),
            confidence,
        }
    }

    fn config() -> SpanConfig {
        SpanConfig {
            strong_interrupts: vec!["death".into()],
            ..SpanConfig::default()
        }
    }

    /// Feed frames `range`, letting `observe` fill in each observation.
    fn drive(
        machine: &mut SpanMachine,
        range: std::ops::RangeInclusive<usize>,
        mut observe: impl FnMut(&mut FrameObservation),
    ) -> Vec<SpanEvent> {
        let mut events = Vec::new();
        for frame in range {
            let mut obs = FrameObservation::new(frame);
            observe(&mut obs);
            events.extend(machine.step(obs));
        }
        events
    }

    fn closed(events: &[SpanEvent]) -> Vec<&PlanSpan> {
        events
            .iter()
            .filter_map(|e| match e {
                SpanEvent::Closed(span) => Some(span),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_evidence_beats_later_horizon() {
        let mut machine = SpanMachine::new("ep", &config());
        // Horizon 16 from frame 40 would expire at 55.
        let events = drive(&mut machine, 40..=60, |obs| {
            if obs.frame == 40 {
                obs.directive = Some(directive("ep_p000040", 16));
            }
            if (48..=50).contains(&obs.frame) {
                obs.evidence.push(evidence("enemy_dead", 0.9));
            }
        });

        let spans = closed(&events);
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].t0, spans[0].t_end), (40, 50));
        assert_eq!(spans[0].close_reason, CloseReason::Evidence);
    }

    #[test]
    fn test_horizon_closes_without_evidence() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 40..=60, |obs| {
            if obs.frame == 40 {
                obs.directive = Some(directive("ep_p000040", 16));
            }
            // Too uncertain to count.
            if (48..=50).contains(&obs.frame) {
                obs.evidence.push(evidence("enemy_dead", 0.6));
            }
        });

        let spans = closed(&events);
        assert_eq!((spans[0].t0, spans[0].t_end), (40, 55));
        assert_eq!(spans[0].close_reason, CloseReason::Horizon);
        assert_eq!(spans[0].frame_count(), 16);
    }

    #[test]
    fn test_evidence_run_must_be_consecutive() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 0..=20, |obs| {
            if obs.frame == 0 {
                obs.directive = Some(directive("ep_p000000", 20));
            }
            if [3, 4, 6, 7, 8].contains(&obs.frame) {
                obs.evidence.push(evidence("enemy_dead", 0.95));
            }
        });
        let spans = closed(&events);
        assert_eq!(spans[0].t_end, 8);
        assert_eq!(spans[0].close_reason, CloseReason::Evidence);
    }

    #[test]
    fn test_same_frame_tie_uses_priority() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 10..=20, |obs| {
            if obs.frame == 10 {
                obs.directive = Some(directive("ep_p000010", 30));
            }
            if (13..=15).contains(&obs.frame) {
                obs.evidence.push(evidence("enemy_dead", 0.9));
            }
            if obs.frame == 15 {
                obs.need_replan = true;
                obs.events.push("death".into());
            }
        });
        let spans = closed(&events);
        assert_eq!(spans[0].t_end, 15);
        assert_eq!(spans[0].close_reason, CloseReason::Evidence);
    }

    #[test]
    fn test_replan_beats_interrupt() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 0..=10, |obs| {
            if obs.frame == 0 {
                obs.directive = Some(directive("ep_p000000", 30));
            }
            if obs.frame == 5 {
                obs.need_replan = true;
                obs.events.push("death".into());
            }
        });
        assert_eq!(closed(&events)[0].close_reason, CloseReason::Replan);
    }

    #[test]
    fn test_new_plan_while_open_is_overlap() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 0..=30, |obs| {
            match obs.frame {
                0 => obs.directive = Some(directive("ep_p000000", 10)),
                4 => obs.directive = Some(directive("ep_p000004", 10)),
                // Rejected plans never open, even once the machine is idle.
                12 => obs.directive = Some(directive("ep_p000004", 10)),
                14 => obs.directive = Some(directive("ep_p000014", 5)),
                _ => {}
            }
        });

        let rejected: Vec<&SpanRejection> = events
            .iter()
            .filter_map(|e| match e {
                SpanEvent::Rejected(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].plan_id, "ep_p000004");
        assert_eq!(rejected[0].skip.reason, SkipReason::SpanOverlap);

        let spans = closed(&events);
        let ranges: Vec<(usize, usize)> = spans.iter().map(|s| (s.t0, s.t_end)).collect();
        assert_eq!(ranges, vec![(0, 9), (14, 18)]);
    }

    #[test]
    fn test_gap_discards_open_span() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 0..=6, |obs| {
            if obs.frame == 0 {
                obs.directive = Some(directive("ep_p000000", 10));
            }
            if obs.frame == 3 {
                obs.valid = false;
            }
        });
        assert!(closed(&events).is_empty());
        assert!(matches!(
            &events[..],
            [SpanEvent::Rejected(r)] if r.skip.reason == SkipReason::SpanGap && r.frame == 3
        ));
        assert!(!machine.is_open());
    }

    #[test]
    fn test_unclosed_span_discarded_at_end() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 0..=4, |obs| {
            if obs.frame == 0 {
                obs.directive = Some(directive("ep_p000000", 50));
            }
        });
        assert!(events.is_empty());
        assert_eq!(machine.open_plan(), Some("ep_p000000"));

        let tail = machine.finish();
        assert!(matches!(
            &tail[..],
            [SpanEvent::Rejected(r)] if r.skip.reason == SkipReason::UnclosedSpan
        ));
    }

    #[test]
    fn test_segment_change_breaks_span() {
        let mut machine = SpanMachine::new("ep", &config());
        let events = drive(&mut machine, 0..=8, |obs| {
            if obs.frame == 0 {
                obs.directive = Some(directive("ep_p000000", 20));
            }
            if obs.frame >= 5 {
                obs.segment = 1;
            }
        });
        assert!(matches!(
            &events[..],
            [SpanEvent::Rejected(r)] if r.skip.reason == SkipReason::SpanGap && r.frame == 5
        ));
    }
}
