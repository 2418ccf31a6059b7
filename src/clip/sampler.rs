//! Clip window sampling over aligned segments.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::types::{ClipSample, EpisodeSamples, SampleSkip};
use super::window::{HistoryWindows, LookaheadWindows, Window, WindowGeometry, WindowKind};
use crate::config::SamplerConfig;
use crate::error::{Outcome, Skip, SkipReason};
use crate::session::{EpisodeAlignment, Segment, Session};

/// Derives clip samples from anchors spaced `anchor_stride` apart.
#[derive(Debug, Clone)]
pub struct ClipSampler {
    geometry: WindowGeometry,
    anchor_stride: usize,
}

impl ClipSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        Self {
            geometry: WindowGeometry::from_config(config),
            anchor_stride: config.anchor_stride.max(1),
        }
    }

    /// Sample every anchor of every valid segment of an episode.
    ///
    /// Anchors sit on a global phase (`t % stride == 0`) so that re-running
    /// with different segment edits does not shift surviving anchors.
    pub fn sample_episode(&self, session: &Session, alignment: &EpisodeAlignment) -> EpisodeSamples {
        let mut out = EpisodeSamples {
            episode_id: session.episode_id.clone(),
            ..Default::default()
        };

        for aligned in &alignment.valid {
            let seg = &aligned.segment;
            for t in (seg.start..=seg.end).filter(|t| t % self.anchor_stride == 0) {
                match self.sample_in_segment(session, seg, t) {
                    Ok(sample) => out.samples.push(sample),
                    Err(skip) => {
                        let sample_id = ClipSample::make_id(&session.episode_id, t);
                        debug!(sample_id = %sample_id, reason = %skip.reason, detail = %skip.detail, "Skipping anchor");
                        out.skipped.push(SampleSkip {
                            sample_id,
                            anchor: t,
                            skip,
                        });
                    }
                }
            }
        }

        info!(
            episode = %session.episode_id,
            samples = out.samples.len(),
            skipped = out.skipped.len(),
            "Sampled episode"
        );
        out
    }

    /// Sample a single anchor, locating its segment in the alignment.
    pub fn sample_anchor(
        &self,
        session: &Session,
        alignment: &EpisodeAlignment,
        t: usize,
    ) -> Outcome<ClipSample> {
        let aligned = alignment.segment_of(t).ok_or_else(|| {
            Skip::new(
                SkipReason::OutsideSegment,
                format!("anchor {t} is not inside a valid segment"),
            )
        })?;
        self.sample_in_segment(session, &aligned.segment, t)
    }

    /// Build the sample for anchor `t` inside `segment`.
    ///
    /// Every index of every window must lie inside the segment and have both
    /// a frame and an action; otherwise nothing is emitted.
    pub fn sample_in_segment(
        &self,
        session: &Session,
        segment: &Segment,
        t: usize,
    ) -> Outcome<ClipSample> {
        if !segment.contains(t) {
            return Err(Skip::new(
                SkipReason::OutsideSegment,
                format!("anchor {t} outside segment {}..{}", segment.start, segment.end),
            ));
        }

        let near_past = self.resolve(session, segment, WindowKind::NearPast, t)?;
        let long_past = self.resolve(session, segment, WindowKind::LongPast, t)?;
        let near_future = self.resolve(session, segment, WindowKind::NearFuture, t)?;
        let long_future = self.resolve(session, segment, WindowKind::LongFuture, t)?;

        let action = session
            .action(t)
            .ok_or_else(|| Skip::new(SkipReason::MissingAction, format!("no action at {t}")))?
            .to_string();

        Ok(ClipSample {
            sample_id: ClipSample::make_id(&session.episode_id, t),
            episode_id: session.episode_id.clone(),
            anchor: t,
            frames_root: session.frames_root.clone(),
            history: HistoryWindows {
                near_past,
                long_past,
            },
            lookahead: LookaheadWindows {
                near_future,
                long_future,
            },
            action,
            goal: session.goal(t).map(str::to_string),
            instruct: session.instruct(t).map(str::to_string),
            task_id: session.manifest.task_id.clone(),
            step_id: segment.step_id.clone(),
            step_text: segment.step_text.clone(),
        })
    }

    fn resolve(
        &self,
        session: &Session,
        segment: &Segment,
        kind: WindowKind,
        t: usize,
    ) -> Outcome<Window> {
        let incomplete = |detail: String| Skip::new(SkipReason::IncompleteWindow, detail);

        let indices = self
            .geometry
            .indices(kind, t)
            .ok_or_else(|| incomplete(format!("{} starts before frame 0", kind.name())))?;

        let mut frames = Vec::with_capacity(indices.len());
        for &i in &indices {
            if !segment.contains(i) {
                return Err(incomplete(format!(
                    "{} index {i} crosses segment {}..{}",
                    kind.name(),
                    segment.start,
                    segment.end
                )));
            }
            if !session.is_aligned(i) {
                return Err(incomplete(format!("{} index {i} is missing", kind.name())));
            }
            let rel = session
                .relative_frame(i)
                .ok_or_else(|| incomplete(format!("{} index {i} has no frame", kind.name())))?;
            frames.push(rel);
        }

        Ok(Window { indices, frames })
    }
}

// ---------------------------------------------------------------------------
// QA export
// ---------------------------------------------------------------------------

/// Materialize a random fraction of samples as per-sample folders for manual
/// review: `clips/<sample_id>/{recent,summary,lookahead,lookahead_summary}/`
/// plus `action.txt` and `meta.json`.
///
/// Returns the number of samples exported.
pub fn export_clips(
    out_dir: &Path,
    samples: &[ClipSample],
    ratio: f64,
    seed: u64,
) -> Result<usize> {
    if ratio <= 0.0 {
        return Ok(0);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut exported = 0;

    for sample in samples {
        if rng.gen::<f64>() >= ratio {
            continue;
        }

        let sample_dir = out_dir.join("clips").join(&sample.sample_id);
        let windows = [
            ("recent", &sample.history.near_past),
            ("summary", &sample.history.long_past),
            ("lookahead", &sample.lookahead.near_future),
            ("lookahead_summary", &sample.lookahead.long_future),
        ];
        for (name, window) in windows {
            let dir = sample_dir.join(name);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            for rel in &window.frames {
                let src = sample.frames_root.join(rel);
                let dst = dir.join(file_name_of(rel));
                link_or_copy(&src, &dst)?;
            }
        }

        std::fs::write(sample_dir.join("action.txt"), format!("{}\n", sample.action))
            .with_context(|| format!("Failed to write action for {}", sample.sample_id))?;
        let meta = serde_json::json!({
            "sample_id": sample.sample_id,
            "anchor_t": sample.anchor,
            "mid_step_id": sample.step_id,
            "mid_step_text": sample.step_text,
        });
        std::fs::write(sample_dir.join("meta.json"), serde_json::to_string_pretty(&meta)?)
            .with_context(|| format!("Failed to write meta for {}", sample.sample_id))?;

        exported += 1;
    }

    info!(exported, total = samples.len(), "Exported QA clips");
    Ok(exported)
}

fn file_name_of(rel: &str) -> PathBuf {
    Path::new(rel)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(rel))
}

fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        return Ok(());
    }
    if std::fs::hard_link(src, dst).is_err() {
        std::fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}
