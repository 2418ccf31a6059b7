//! Plan id assignment and the per-episode span scan.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::machine::{
    Directive, EvidenceSignal, FrameObservation, PlanSpan, SpanEvent, SpanMachine, SpanRejection,
};
use crate::config::SpanConfig;
use crate::label::{LabelResult, Uncertainty};
use crate::session::{EpisodeAlignment, Session};

/// Spans and plan ids of one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSpans {
    pub episode_id: String,
    pub spans: Vec<PlanSpan>,
    pub rejected: Vec<SpanRejection>,
    /// Plan id assigned to each labeled anchor.
    pub plans: BTreeMap<usize, String>,
}

impl EpisodeSpans {
    /// The closed span covering `frame`, if any.
    pub fn span_at(&self, frame: usize) -> Option<&PlanSpan> {
        let idx = self.spans.partition_point(|s| s.t_end < frame);
        self.spans.get(idx).filter(|s| s.contains(frame))
    }
}

/// Label state carried from an anchor to the frames after it.
#[derive(Debug, Clone, Copy, Default)]
struct Inherited {
    confidence: f64,
    need_replan: bool,
}

pub struct PlanSpanAligner {
    config: SpanConfig,
}

impl PlanSpanAligner {
    pub fn new(config: SpanConfig) -> Self {
        Self { config }
    }

    /// Walk every frame of the episode in order, feeding the span machine.
    ///
    /// `labels` holds the accepted label of each anchor.
    pub fn align_episode(
        &self,
        session: &Session,
        alignment: &EpisodeAlignment,
        labels: &BTreeMap<usize, &LabelResult>,
    ) -> EpisodeSpans {
        let episode_id = session.episode_id.clone();
        let mut machine = SpanMachine::new(episode_id.clone(), &self.config);
        let mut out = EpisodeSpans {
            episode_id: episode_id.clone(),
            ..Default::default()
        };

        // Op signature of every minted plan, by id.
        let mut signatures: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        let mut inherited: Option<Inherited> = None;

        for frame in 0..session.len() {
            let mut obs = FrameObservation::new(frame);
            match alignment.segment_of(frame) {
                Some(seg) => obs.segment = seg.segment_index,
                None => {
                    obs.valid = false;
                    inherited = None;
                }
            }

            let mut frame_state: Option<Inherited> = None;
            let mut adopted: Option<(String, Inherited)> = None;
            if let Some(label) = labels.get(&frame).filter(|_| obs.valid) {
                let ops = label.op_signature();
                // Only the plan that owns the open span can be continued.
                let open = machine
                    .open_plan()
                    .filter(|id| signatures.get(*id).is_some_and(|sig| *sig == ops))
                    .map(str::to_string);
                let continues = open.is_some();
                let plan_id = match open {
                    Some(id) => id,
                    None => {
                        let id = format!("{episode_id}_p{frame:06}");
                        debug!(plan_id = %id, anchor = frame, "Minted plan");
                        signatures.insert(id.clone(), ops);
                        id
                    }
                };
                out.plans.insert(frame, plan_id.clone());
                let state = Inherited {
                    confidence: self.confidence(label.uncertainty),
                    need_replan: continues && label.need_replan,
                };
                // A label bound for overlap rejection must not steer the
                // open span; it only takes over once its plan is open.
                if continues || !machine.is_open() {
                    frame_state = Some(state);
                }
                adopted = Some((plan_id.clone(), state));
                obs.directive = Some(Directive {
                    plan_id,
                    short_goal_dsl: label.short_goal_dsl.clone(),
                    horizon_steps: label.horizon_steps,
                    done_evidence: label.done_evidence.clone(),
                });
            }

            if obs.valid {
                let state = frame_state.or(inherited).unwrap_or_default();
                obs.need_replan = state.need_replan;
                for event in session.events_with_confidence_at(frame) {
                    obs.evidence.push(EvidenceSignal {
                        tag: event.class.clone(),
                        confidence: event.confidence.unwrap_or(state.confidence),
                    });
                    obs.events.push(event.class.clone());
                }
            }

            for event in machine.step(obs) {
                out.record(event);
            }
            if let Some((plan_id, state)) = adopted {
                if machine.open_plan() == Some(plan_id.as_str()) {
                    inherited = Some(state);
                }
            }
        }
        for event in machine.finish() {
            out.record(event);
        }

        debug!(
            episode = %episode_id,
            spans = out.spans.len(),
            rejected = out.rejected.len(),
            "Span scan complete"
        );
        out
    }

    fn confidence(&self, uncertainty: Uncertainty) -> f64 {
        self.config
            .uncertainty_confidence
            .get(&uncertainty)
            .copied()
            .unwrap_or(0.0)
    }
}

impl EpisodeSpans {
    fn record(&mut self, event: SpanEvent) {
        match event {
            SpanEvent::Closed(span) => self.spans.push(span),
            SpanEvent::Rejected(rejection) => self.rejected.push(rejection),
        }
    }
}
