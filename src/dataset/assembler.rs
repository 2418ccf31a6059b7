//! End-to-end dataset assembly.
//!
//! ```text
//! Stage 1  extract   load sessions, align frames/actions, sample clips
//!                    (parallel over episodes)
//! Stage 2  label     batched, cached labeling of every clip sample
//! Stage 3  build     plan spans, retrieval snapshots, planner and
//!                    controller streams (parallel over episodes)
//! ```
//!
//! Each stage produces its own [`BuildReport`]; episode-level reports are
//! merged once the parallel work completes. Output streams are written in
//! episode order so that reruns over the same inputs are byte-identical.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::controller::{build_controller_records, ControllerRecord};
use super::planner::{build_planner_record, PlannerRecord};
use super::report::{stage, stream, BuildReport};
use super::writer::JsonlWriter;
use crate::clip::{export_clips, ClipSample, ClipSampler, EpisodeSamples};
use crate::config::PipelineConfig;
use crate::error::{Skip, SkipReason};
use crate::label::{LabelBatcher, LabelRecord, LabelResult, LabelService, LabelStatus};
use crate::retrieval::RetrievalConstructor;
use crate::session::loader::read_jsonl;
use crate::session::{
    discover_sessions, load_session, EpisodeAlignment, FrameActionAligner, Session,
};
use crate::span::{EpisodeSpans, PlanSpan, PlanSpanAligner};

pub const CLIP_INDEX_FILE: &str = "clip_index.jsonl";
pub const LABELS_FILE: &str = "labels.jsonl";
pub const LABEL_CACHE_FILE: &str = "label_cache.jsonl";
pub const SPANS_FILE: &str = "spans.jsonl";
pub const PLANNER_FILE: &str = "planner.jsonl";
pub const CONTROLLER_FILE: &str = "controller.jsonl";
pub const EXTRACT_REPORT_FILE: &str = "extract_report.json";
pub const LABEL_REPORT_FILE: &str = "label_report.json";
pub const BUILD_REPORT_FILE: &str = "build_report.json";
pub const QA_CLIPS_DIR: &str = "clips";

/// One episode after alignment and sampling.
#[derive(Debug, Clone)]
pub struct Episode {
    pub session: Session,
    pub alignment: EpisodeAlignment,
    pub samples: EpisodeSamples,
}

/// Stage 3 output of one episode, before it is written.
#[derive(Debug)]
struct EpisodeOutput {
    spans: Vec<PlanSpan>,
    planner: Vec<PlannerRecord>,
    controller: Vec<ControllerRecord>,
    report: BuildReport,
}

pub struct DatasetAssembler {
    config: PipelineConfig,
}

impl DatasetAssembler {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn new_report(&self) -> BuildReport {
        let mut report = BuildReport::new(&self.config.assembler.schema_version);
        report.policy_version = Some(self.config.retrieval.policy_version.clone());
        report
    }

    // ------------------------------------------------------------------
    // Stage 1: extract
    // ------------------------------------------------------------------

    /// Load, align and sample every session under `sessions_dir`.
    ///
    /// An unreadable root aborts the run; a malformed session is dropped and
    /// reported.
    pub fn extract_episodes(&self, sessions_dir: &Path) -> Result<(Vec<Episode>, BuildReport)> {
        let dirs = discover_sessions(sessions_dir)?;
        let aligner = FrameActionAligner::new(self.config.aligner.clone());
        let sampler = ClipSampler::new(&self.config.sampler);

        let results: Vec<(Option<Episode>, BuildReport)> = dirs
            .par_iter()
            .map(|dir| {
                let mut report = self.new_report();
                let session = match load_session(dir, &self.config.aligner) {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Dropping malformed session");
                        report.episodes_seen += 1;
                        report.episodes_dropped += 1;
                        report.record_skip(stage::ALIGN, SkipReason::MalformedSession);
                        return (None, report);
                    }
                };

                let alignment = aligner.align(&session);
                report.record_alignment(&alignment);
                let samples = sampler.sample_episode(&session, &alignment);
                for skipped in &samples.skipped {
                    report.record_skip(stage::SAMPLE, skipped.skip.reason);
                }
                report.record_emitted(stream::CLIPS, samples.samples.len());
                debug!(
                    episode = %session.episode_id,
                    samples = samples.samples.len(),
                    skipped = samples.skipped.len(),
                    "Episode extracted"
                );

                let episode = Episode {
                    session,
                    alignment,
                    samples,
                };
                (Some(episode), report)
            })
            .collect();

        let mut report = self.new_report();
        let mut episodes = Vec::with_capacity(results.len());
        for (episode, episode_report) in results {
            report.merge(episode_report);
            episodes.extend(episode);
        }

        info!(
            episodes = episodes.len(),
            samples = report.emitted_count(stream::CLIPS),
            skipped = report.skipped_total(),
            "Extraction complete"
        );
        Ok((episodes, report))
    }

    /// Write `clip_index.jsonl` and the optional QA export.
    pub fn write_clip_index(&self, episodes: &[Episode], out_dir: &Path) -> Result<usize> {
        let mut writer = JsonlWriter::create(&out_dir.join(CLIP_INDEX_FILE))?;
        for sample in episodes.iter().flat_map(|e| &e.samples.samples) {
            writer.write(sample)?;
        }
        writer.flush()?;

        let sampler = &self.config.sampler;
        if sampler.export_ratio > 0.0 {
            let samples: Vec<ClipSample> = all_samples(episodes).cloned().collect();
            let exported = export_clips(
                &out_dir.join(QA_CLIPS_DIR),
                &samples,
                sampler.export_ratio,
                sampler.export_seed,
            )?;
            info!(exported, "Exported QA clips");
        }
        Ok(writer.written())
    }

    /// Stage 1 with its outputs written to `out_dir`.
    pub fn extract(
        &self,
        sessions_dir: &Path,
        out_dir: &Path,
    ) -> Result<(Vec<Episode>, BuildReport)> {
        let (episodes, mut report) = self.extract_episodes(sessions_dir)?;
        self.write_clip_index(&episodes, out_dir)?;
        report.finish();
        report.save(&out_dir.join(EXTRACT_REPORT_FILE))?;
        Ok((episodes, report))
    }

    // ------------------------------------------------------------------
    // Stage 2: label
    // ------------------------------------------------------------------

    /// Label every sample not already present in `labels.jsonl`.
    ///
    /// Records are appended batch by batch, so an interrupted run resumes
    /// where it stopped. The returned records cover all samples, old and new.
    pub async fn label<S: LabelService>(
        &self,
        batcher: &LabelBatcher<S>,
        samples: &[ClipSample],
        out_dir: &Path,
    ) -> Result<(Vec<LabelRecord>, BuildReport)> {
        let labels_path = out_dir.join(LABELS_FILE);
        let existing: Vec<LabelRecord> = if labels_path.exists() {
            read_complete_lines(&labels_path)?
        } else {
            Vec::new()
        };
        let mut by_id = latest_by_sample(existing);
        // The threshold may have changed since these records were written.
        let threshold = batcher.exclusion_threshold();
        for record in by_id.values_mut() {
            record.apply_uncertainty_threshold(threshold);
        }

        // Failed items are retried on the next run.
        let pending: Vec<ClipSample> = samples
            .iter()
            .filter(|s| {
                by_id
                    .get(&s.sample_id)
                    .map_or(true, |r| r.status == LabelStatus::Failed)
            })
            .cloned()
            .collect();
        info!(
            total = samples.len(),
            already_labeled = samples.len() - pending.len(),
            pending = pending.len(),
            "Labeling samples"
        );

        let mut writer = JsonlWriter::append(&labels_path)?;
        let fresh = batcher
            .run(&pending, |batch| {
                for record in batch {
                    writer.write(record)?;
                }
                writer.flush()
            })
            .await?;
        for record in fresh {
            by_id.insert(record.sample_id.clone(), record);
        }

        let wanted: HashSet<&str> = samples.iter().map(|s| s.sample_id.as_str()).collect();
        let records: Vec<LabelRecord> = by_id
            .into_values()
            .filter(|r| wanted.contains(r.sample_id.as_str()))
            .collect();

        let mut report = self.label_report(&records);
        report.vocab_version = Some(batcher.vocab_version().to_string());
        report.finish();
        report.save(&out_dir.join(LABEL_REPORT_FILE))?;
        Ok((records, report))
    }

    /// Label statistics derived from label records.
    pub fn label_report(&self, records: &[LabelRecord]) -> BuildReport {
        let mut report = self.new_report();
        for record in records {
            report.record_label(record);
        }
        report.record_emitted(
            stream::LABELS,
            records.iter().filter(|r| r.accepted().is_some()).count(),
        );
        report
    }

    /// Read `labels.jsonl` from a previous labeling run, keeping the latest
    /// record of each sample.
    pub fn load_labels(&self, out_dir: &Path) -> Result<Vec<LabelRecord>> {
        let path = out_dir.join(LABELS_FILE);
        if !path.exists() {
            warn!(path = %path.display(), "No labels found; every sample will miss its label");
            return Ok(Vec::new());
        }
        Ok(latest_by_sample(read_complete_lines(&path)?)
            .into_values()
            .collect())
    }

    // ------------------------------------------------------------------
    // Stage 3: build
    // ------------------------------------------------------------------

    /// Build spans and both training streams into `out_dir`.
    pub fn build(
        &self,
        episodes: &[Episode],
        labels: &[LabelRecord],
        retrieval: &RetrievalConstructor,
        out_dir: &Path,
    ) -> Result<BuildReport> {
        let accepted: HashMap<&str, &LabelResult> = labels
            .iter()
            .filter_map(|r| r.accepted().map(|l| (r.sample_id.as_str(), l)))
            .collect();
        let span_aligner = PlanSpanAligner::new(self.config.span.clone());

        let outputs: Vec<EpisodeOutput> = episodes
            .par_iter()
            .map(|episode| self.build_episode(episode, &accepted, &span_aligner, retrieval))
            .collect();

        let mut spans = JsonlWriter::create(&out_dir.join(SPANS_FILE))?;
        let mut planner = JsonlWriter::create(&out_dir.join(PLANNER_FILE))?;
        let mut controller = JsonlWriter::create(&out_dir.join(CONTROLLER_FILE))?;
        let mut report = self.new_report();

        for output in outputs {
            for span in &output.spans {
                spans.write(span)?;
            }
            for record in &output.planner {
                planner.write(record)?;
            }
            for record in &output.controller {
                controller.write(record)?;
            }
            report.merge(output.report);
        }
        spans.flush()?;
        planner.flush()?;
        controller.flush()?;

        info!(
            spans = spans.written(),
            planner = planner.written(),
            controller = controller.written(),
            "Build complete"
        );
        Ok(report)
    }

    fn build_episode(
        &self,
        episode: &Episode,
        accepted: &HashMap<&str, &LabelResult>,
        span_aligner: &PlanSpanAligner,
        retrieval: &RetrievalConstructor,
    ) -> EpisodeOutput {
        let schema_version = &self.config.assembler.schema_version;
        let mut report = self.new_report();
        let samples = &episode.samples.samples;

        let labels: BTreeMap<usize, &LabelResult> = samples
            .iter()
            .filter_map(|s| accepted.get(s.sample_id.as_str()).map(|l| (s.anchor, *l)))
            .collect();
        let EpisodeSpans {
            spans,
            rejected,
            plans,
            ..
        } = span_aligner.align_episode(&episode.session, &episode.alignment, &labels);

        for rejection in &rejected {
            report.record_skip(stage::SPAN, rejection.skip.reason);
        }

        let mut planner = Vec::new();
        for sample in samples {
            let Some(label) = labels.get(&sample.anchor).copied() else {
                report.record_skip(stage::PLANNER, SkipReason::MissingLabel);
                continue;
            };
            let snapshot = retrieval.snapshot(sample);
            report.record_snapshot(&snapshot);
            if snapshot.is_empty() && self.config.assembler.require_retrieval_hits {
                report.record_skip(stage::PLANNER, SkipReason::MissingRetrieval);
                continue;
            }
            let plan_id = plans.get(&sample.anchor).map(String::as_str);
            match build_planner_record(sample, Some(label), plan_id, snapshot, schema_version) {
                Ok(record) => planner.push(record),
                Err(skip) => report_skip(&mut report, stage::PLANNER, &sample.sample_id, &skip),
            }
        }

        let mut controller = Vec::new();
        for span in &spans {
            report.record_span(span);
            let (records, skipped) = build_controller_records(
                &episode.session,
                &episode.alignment,
                span,
                self.config.span.history_frames,
                schema_version,
            );
            for skip in &skipped {
                report_skip(&mut report, stage::CONTROLLER, &span.plan_id, skip);
            }
            controller.extend(records);
        }

        report.record_emitted(stream::PLANNER, planner.len());
        report.record_emitted(stream::CONTROLLER, controller.len());
        debug!(
            episode = %episode.session.episode_id,
            spans = spans.len(),
            planner = planner.len(),
            controller = controller.len(),
            "Episode built"
        );

        EpisodeOutput {
            spans,
            planner,
            controller,
            report,
        }
    }

    // ------------------------------------------------------------------
    // Full run
    // ------------------------------------------------------------------

    /// All three stages in one process, with one merged report.
    pub async fn run<S: LabelService>(
        &self,
        sessions_dir: &Path,
        out_dir: &Path,
        batcher: &LabelBatcher<S>,
        retrieval: &RetrievalConstructor,
    ) -> Result<BuildReport> {
        let (episodes, mut report) = self.extract(sessions_dir, out_dir)?;
        let samples: Vec<ClipSample> = all_samples(&episodes).cloned().collect();
        let (labels, label_report) = self.label(batcher, &samples, out_dir).await?;
        report.merge(label_report);
        report.merge(self.build(&episodes, &labels, retrieval, out_dir)?);
        self.finish_report(report, out_dir)
    }

    /// Stamp and write the final report.
    pub fn finish_report(&self, mut report: BuildReport, out_dir: &Path) -> Result<BuildReport> {
        report.finish();
        let path = out_dir.join(BUILD_REPORT_FILE);
        report.save(&path)?;
        info!(
            path = %path.display(),
            planner = report.emitted_count(stream::PLANNER),
            controller = report.emitted_count(stream::CONTROLLER),
            skipped = report.skipped_total(),
            "Wrote build report"
        );
        Ok(report)
    }
}

/// Every sample of every episode, in episode order.
pub fn all_samples(episodes: &[Episode]) -> impl Iterator<Item = &ClipSample> {
    episodes.iter().flat_map(|e| e.samples.samples.iter())
}

/// Later records of a sample replace earlier ones.
fn latest_by_sample(records: Vec<LabelRecord>) -> BTreeMap<String, LabelRecord> {
    records
        .into_iter()
        .map(|r| (r.sample_id.clone(), r))
        .collect()
}

fn report_skip(report: &mut BuildReport, stage: &str, item: &str, skip: &Skip) {
    debug!(stage, item, reason = %skip.reason, detail = %skip.detail, "Skipped");
    report.record_skip(stage, skip.reason);
}

/// Read a JSONL stream written by this crate, tolerating a partial last line
/// left by an interrupted run.
fn read_complete_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match read_jsonl(path) {
        Ok(records) => Ok(records),
        Err(e) => {
            let text = std::fs::read_to_string(path)?;
            let complete = text.rfind('\n').map_or("", |end| &text[..end]);
            warn!(path = %path.display(), error = %e, "Ignoring partial trailing line");
            complete
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| serde_json::from_str(l).map_err(Into::into))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelerConfig, SamplerConfig};
    use crate::label::{LabelCache, LabelError, LabelRequest};
    use crate::retrieval::HistoryCorpus;
    use crate::vocab::fixtures::test_vocab;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct FixedService {
        calls: AtomicUsize,
        uncertainty: &'static str,
    }

    impl FixedService {
        fn new(uncertainty: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                uncertainty,
            }
        }
    }

    impl LabelService for FixedService {
        async fn label(&self, _request: LabelRequest<'_>) -> Result<String, LabelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({
                "goal": "<|goal_start|>reach the gate<|goal_end|>",
                "next_mid_step": "reach_gate",
                "short_goal_dsl": [{"op": "MOVE_TO", "args": ["gate"]}],
                "horizon_steps": 4,
                "done_evidence": ["target_reached"],
                "fallback_if_failed": ["retreat"],
                "uncertainty": self.uncertainty,
                "attempt": "gate is visible ahead"
            })
            .to_string())
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            sampler: SamplerConfig {
                anchor_stride: 2,
                near_window: 2,
                summary_span: 4,
                summary_stride: 2,
                ..SamplerConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn write_session(dir: &Path, frames: usize) {
        let frames_dir = dir.join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();
        let mut actions = String::new();
        let mut goals = String::new();
        for i in 0..frames {
            std::fs::write(frames_dir.join(format!("{:06}.jpg", i + 1)), format!("jpg{i}")).unwrap();
            actions.push_str(&format!("act_{i}\n"));
            goals.push_str("reach the gate\n");
        }
        std::fs::write(dir.join("actions.txt"), actions).unwrap();
        std::fs::write(dir.join("goals.txt"), goals).unwrap();
    }

    fn batcher(service: FixedService) -> LabelBatcher<FixedService> {
        batcher_with(service, config().labeler)
    }

    fn batcher_with(service: FixedService, labeler: LabelerConfig) -> LabelBatcher<FixedService> {
        LabelBatcher::new(
            service,
            LabelCache::in_memory(),
            test_vocab(),
            labeler,
            config().assembler.schema_version,
        )
    }

    fn calls(batcher: &LabelBatcher<FixedService>) -> usize {
        batcher.service().calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_extract_drops_malformed_session() {
        let tmp = tempdir().unwrap();
        write_session(&tmp.path().join("good"), 20);
        let bad = tmp.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join("actions.txt"), "a\n").unwrap();

        let assembler = DatasetAssembler::new(config());
        let (episodes, report) = assembler.extract_episodes(tmp.path()).unwrap();

        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].session.episode_id, "good");
        assert_eq!(report.episodes_seen, 2);
        assert_eq!(report.episodes_dropped, 1);
        assert_eq!(report.skip_count(stage::ALIGN, SkipReason::MalformedSession), 1);
        // Anchors 4..=14 fit every window; 0, 2, 16 and 18 do not.
        assert_eq!(report.emitted_count(stream::CLIPS), 6);
        assert_eq!(report.skip_count(stage::SAMPLE, SkipReason::IncompleteWindow), 4);
    }

    #[test]
    fn test_missing_session_root_is_fatal() {
        let tmp = tempdir().unwrap();
        let assembler = DatasetAssembler::new(config());
        assert!(assembler.extract_episodes(&tmp.path().join("missing")).is_err());
    }

    #[test]
    fn test_build_without_labels_skips_planner_samples() {
        let tmp = tempdir().unwrap();
        let sessions = tmp.path().join("sessions");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        write_session(&sessions.join("ep"), 20);

        let assembler = DatasetAssembler::new(config());
        let (episodes, _) = assembler.extract_episodes(&sessions).unwrap();
        let retrieval = RetrievalConstructor::new(
            assembler.config().retrieval.clone(),
            HistoryCorpus::default(),
            Vec::new(),
        );
        let report = assembler.build(&episodes, &[], &retrieval, &out).unwrap();

        assert_eq!(report.emitted_count(stream::PLANNER), 0);
        assert_eq!(report.skip_count(stage::PLANNER, SkipReason::MissingLabel), 6);
        assert!(out.join(PLANNER_FILE).exists());
        assert_eq!(std::fs::read_to_string(out.join(SPANS_FILE)).unwrap(), "");
    }

    #[tokio::test]
    async fn test_run_writes_streams_and_resumes() {
        let tmp = tempdir().unwrap();
        let sessions = tmp.path().join("sessions");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        write_session(&sessions.join("ep"), 20);

        let assembler = DatasetAssembler::new(config());
        let retrieval = RetrievalConstructor::new(
            assembler.config().retrieval.clone(),
            HistoryCorpus::default(),
            Vec::new(),
        );

        let first = batcher(FixedService::new("low"));
        let report = assembler.run(&sessions, &out, &first, &retrieval).await.unwrap();
        assert_eq!(calls(&first), 6);
        assert_eq!(report.labels.accepted, 6);
        assert_eq!(report.emitted_count(stream::PLANNER), 6);
        assert!(report.emitted_count(stream::SPANS) > 0);
        assert_eq!(report.vocab_version, Some(test_vocab().version.clone()));
        assert_eq!(report.policy_version.as_deref(), Some("recency-v1"));

        let planner: Vec<PlannerRecord> = read_jsonl(&out.join(PLANNER_FILE)).unwrap();
        assert_eq!(planner.len(), 6);
        assert!(planner.iter().all(|r| r.plan_id.starts_with("ep_p")));
        let spans: Vec<PlanSpan> = read_jsonl(&out.join(SPANS_FILE)).unwrap();
        let controller: Vec<ControllerRecord> = read_jsonl(&out.join(CONTROLLER_FILE)).unwrap();
        let span_frames: usize = spans.iter().map(PlanSpan::frame_count).sum();
        assert_eq!(controller.len(), span_frames);
        assert_eq!(report.emitted_count(stream::CONTROLLER), span_frames);

        let saved = BuildReport::load(&out.join(BUILD_REPORT_FILE)).unwrap();
        assert_eq!(saved.run_id, report.run_id);

        // A second run finds every sample already labeled.
        let second = batcher(FixedService::new("low"));
        let rerun = assembler.run(&sessions, &out, &second, &retrieval).await.unwrap();
        assert_eq!(calls(&second), 0);
        assert_eq!(rerun.labels.accepted, 6);
        let again: Vec<PlannerRecord> = read_jsonl(&out.join(PLANNER_FILE)).unwrap();
        assert_eq!(again, planner);
    }

    #[tokio::test]
    async fn test_resume_reapplies_uncertainty_threshold() {
        let tmp = tempdir().unwrap();
        let sessions = tmp.path().join("sessions");
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        write_session(&sessions.join("ep"), 20);

        let assembler = DatasetAssembler::new(config());
        let (episodes, _) = assembler.extract_episodes(&sessions).unwrap();
        let samples: Vec<ClipSample> = all_samples(&episodes).cloned().collect();

        let strict = batcher(FixedService::new("high"));
        let (records, _) = assembler.label(&strict, &samples, &out).await.unwrap();
        assert!(records.iter().all(|r| r.status == LabelStatus::Excluded));

        let lenient = batcher_with(
            FixedService::new("high"),
            LabelerConfig {
                exclude_uncertainty_at_or_above: None,
                ..LabelerConfig::default()
            },
        );
        let (records, report) = assembler.label(&lenient, &samples, &out).await.unwrap();
        assert_eq!(calls(&lenient), 0);
        assert_eq!(report.labels.accepted, 6);
        assert!(records.iter().all(|r| r.accepted().is_some() && r.skip.is_none()));
    }

    #[test]
    fn test_partial_trailing_line_is_ignored() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(LABELS_FILE);
        std::fs::write(&path, "{\"a\": 1}\n{\"a\": 2}\n{\"a\":").unwrap();
        let values: Vec<serde_json::Value> = read_complete_lines(&path).unwrap();
        assert_eq!(values.len(), 2);
    }
}
