//! The build report: the single record of what a run emitted, what it
//! skipped, and why.
//!
//! Per-episode reports are built independently and merged afterwards, so no
//! counter is shared between parallel workers.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::writer::write_json_atomic;
use crate::error::SkipReason;
use crate::label::{LabelRecord, LabelStatus, Uncertainty};
use crate::retrieval::RetrievalSnapshot;
use crate::session::EpisodeAlignment;
use crate::span::{CloseReason, PlanSpan};

/// Pipeline stages that record skips.
pub mod stage {
    pub const ALIGN: &str = "align";
    pub const SAMPLE: &str = "sample";
    pub const LABEL: &str = "label";
    pub const SPAN: &str = "span";
    pub const PLANNER: &str = "planner";
    pub const CONTROLLER: &str = "controller";
}

/// Output stream names.
pub mod stream {
    pub const CLIPS: &str = "clips";
    pub const LABELS: &str = "labels";
    pub const SPANS: &str = "spans";
    pub const PLANNER: &str = "planner";
    pub const CONTROLLER: &str = "controller";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelCounts {
    pub requested: usize,
    pub accepted: usize,
    pub excluded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub network_attempts: usize,
    pub transient_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalCounts {
    pub snapshots: usize,
    /// Snapshots with at least one entry.
    pub with_hits: usize,
    pub entries: usize,
    pub backfilled: usize,
}

impl RetrievalCounts {
    pub fn hit_rate(&self) -> f64 {
        if self.snapshots == 0 {
            return 0.0;
        }
        self.with_hits as f64 / self.snapshots as f64
    }
}

/// Summary statistics over the span-length histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LengthStats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub schema_version: String,
    #[serde(default)]
    pub vocab_version: Option<String>,
    #[serde(default)]
    pub policy_version: Option<String>,

    #[serde(default)]
    pub episodes_seen: usize,
    #[serde(default)]
    pub episodes_dropped: usize,
    #[serde(default)]
    pub segments_valid: usize,
    #[serde(default)]
    pub segments_dropped: usize,

    /// Records written per output stream.
    #[serde(default)]
    pub emitted: BTreeMap<String, usize>,
    /// Skips per stage and reason.
    #[serde(default)]
    pub skipped: BTreeMap<String, BTreeMap<SkipReason, usize>>,

    #[serde(default)]
    pub labels: LabelCounts,
    /// Schema violations per offending field.
    #[serde(default)]
    pub validation_failures: BTreeMap<String, usize>,
    /// Uncertainty of every valid label, excluded ones included.
    #[serde(default)]
    pub uncertainty: BTreeMap<Uncertainty, usize>,
    /// Accepted labels per task id.
    #[serde(default)]
    pub task_coverage: BTreeMap<String, usize>,

    /// Span length (frames) to number of spans.
    #[serde(default)]
    pub span_lengths: BTreeMap<usize, usize>,
    #[serde(default)]
    pub close_reasons: BTreeMap<CloseReason, usize>,

    #[serde(default)]
    pub retrieval: RetrievalCounts,
}

impl BuildReport {
    pub fn new(schema_version: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            schema_version: schema_version.into(),
            vocab_version: None,
            policy_version: None,
            episodes_seen: 0,
            episodes_dropped: 0,
            segments_valid: 0,
            segments_dropped: 0,
            emitted: BTreeMap::new(),
            skipped: BTreeMap::new(),
            labels: LabelCounts::default(),
            validation_failures: BTreeMap::new(),
            uncertainty: BTreeMap::new(),
            task_coverage: BTreeMap::new(),
            span_lengths: BTreeMap::new(),
            close_reasons: BTreeMap::new(),
            retrieval: RetrievalCounts::default(),
        }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    pub fn record_skip(&mut self, stage: &str, reason: SkipReason) {
        *self
            .skipped
            .entry(stage.to_string())
            .or_default()
            .entry(reason)
            .or_default() += 1;
    }

    pub fn record_emitted(&mut self, stream: &str, count: usize) {
        *self.emitted.entry(stream.to_string()).or_default() += count;
    }

    pub fn record_alignment(&mut self, alignment: &EpisodeAlignment) {
        self.episodes_seen += 1;
        if let Some(skip) = &alignment.episode_drop {
            self.episodes_dropped += 1;
            self.record_skip(stage::ALIGN, skip.reason);
        }
        self.segments_valid += alignment.valid.len();
        self.segments_dropped += alignment.dropped.len();
        for drop in &alignment.dropped {
            self.record_skip(stage::ALIGN, drop.skip.reason);
        }
    }

    pub fn record_label(&mut self, record: &LabelRecord) {
        self.labels.requested += 1;
        self.labels.network_attempts += record.attempts;
        self.labels.transient_failures += record.transient_failures;
        if record.from_cache {
            self.labels.cache_hits += 1;
        }
        if let Some(label) = &record.label {
            *self.uncertainty.entry(label.uncertainty).or_default() += 1;
        }
        match record.status {
            LabelStatus::Accepted => {
                self.labels.accepted += 1;
                let task = record.task_id.as_deref().unwrap_or("unknown");
                *self.task_coverage.entry(task.to_string()).or_default() += 1;
            }
            LabelStatus::Excluded => self.labels.excluded += 1,
            LabelStatus::Failed => self.labels.failed += 1,
        }
        if let Some(skip) = &record.skip {
            self.record_skip(stage::LABEL, skip.reason);
        }
        if let Some(field) = &record.invalid_field {
            *self.validation_failures.entry(field.clone()).or_default() += 1;
        }
    }

    pub fn record_span(&mut self, span: &PlanSpan) {
        *self.span_lengths.entry(span.frame_count()).or_default() += 1;
        *self.close_reasons.entry(span.close_reason).or_default() += 1;
        self.record_emitted(stream::SPANS, 1);
    }

    pub fn record_snapshot(&mut self, snapshot: &RetrievalSnapshot) {
        self.retrieval.snapshots += 1;
        self.retrieval.entries += snapshot.entries.len();
        self.retrieval.backfilled += snapshot.backfilled();
        if !snapshot.is_empty() {
            self.retrieval.with_hits += 1;
        }
    }

    /// Fold a per-episode or per-stage report into this one.
    pub fn merge(&mut self, other: BuildReport) {
        self.episodes_seen += other.episodes_seen;
        self.episodes_dropped += other.episodes_dropped;
        self.segments_valid += other.segments_valid;
        self.segments_dropped += other.segments_dropped;
        merge_counts(&mut self.emitted, other.emitted);
        for (stage, reasons) in other.skipped {
            merge_counts(self.skipped.entry(stage).or_default(), reasons);
        }

        let l = other.labels;
        self.labels.requested += l.requested;
        self.labels.accepted += l.accepted;
        self.labels.excluded += l.excluded;
        self.labels.failed += l.failed;
        self.labels.cache_hits += l.cache_hits;
        self.labels.network_attempts += l.network_attempts;
        self.labels.transient_failures += l.transient_failures;
        merge_counts(&mut self.validation_failures, other.validation_failures);
        merge_counts(&mut self.uncertainty, other.uncertainty);
        merge_counts(&mut self.task_coverage, other.task_coverage);

        merge_counts(&mut self.span_lengths, other.span_lengths);
        merge_counts(&mut self.close_reasons, other.close_reasons);

        self.retrieval.snapshots += other.retrieval.snapshots;
        self.retrieval.with_hits += other.retrieval.with_hits;
        self.retrieval.entries += other.retrieval.entries;
        self.retrieval.backfilled += other.retrieval.backfilled;

        if self.vocab_version.is_none() {
            self.vocab_version = other.vocab_version;
        }
        if self.policy_version.is_none() {
            self.policy_version = other.policy_version;
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn emitted_count(&self, stream: &str) -> usize {
        self.emitted.get(stream).copied().unwrap_or(0)
    }

    pub fn skip_count(&self, stage: &str, reason: SkipReason) -> usize {
        self.skipped
            .get(stage)
            .and_then(|r| r.get(&reason))
            .copied()
            .unwrap_or(0)
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().flat_map(|r| r.values()).sum()
    }

    pub fn span_length_stats(&self) -> Option<LengthStats> {
        let count: usize = self.span_lengths.values().sum();
        if count == 0 {
            return None;
        }
        let total: usize = self.span_lengths.iter().map(|(len, n)| len * n).sum();
        Some(LengthStats {
            count,
            min: *self.span_lengths.keys().next()?,
            max: *self.span_lengths.keys().next_back()?,
            mean: total as f64 / count as f64,
        })
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse report {}", path.display()))
    }

    /// Human-readable summary for `inspect`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {}  schema {}", self.run_id, self.schema_version);
        if let Some(v) = &self.vocab_version {
            let _ = writeln!(out, "vocab {v}");
        }
        let _ = writeln!(
            out,
            "episodes {} ({} dropped), segments {} valid / {} dropped",
            self.episodes_seen, self.episodes_dropped, self.segments_valid, self.segments_dropped
        );

        let _ = writeln!(out, "\nemitted:");
        for (stream, n) in &self.emitted {
            let _ = writeln!(out, "  {stream:<12} {n}");
        }

        let _ = writeln!(out, "\nskipped ({} total):", self.skipped_total());
        for (stage, reasons) in &self.skipped {
            for (reason, n) in reasons {
                let _ = writeln!(out, "  {stage:<12} {:<28} {n}", reason.as_str());
            }
        }

        let l = &self.labels;
        let _ = writeln!(
            out,
            "\nlabels: {} requested, {} accepted, {} excluded, {} failed, {} cache hits, {} transient failures",
            l.requested, l.accepted, l.excluded, l.failed, l.cache_hits, l.transient_failures
        );
        for (field, n) in &self.validation_failures {
            let _ = writeln!(out, "  invalid {field:<20} {n}");
        }
        for (u, n) in &self.uncertainty {
            let _ = writeln!(out, "  uncertainty {:<6} {n}", u.as_str());
        }
        for (task, n) in &self.task_coverage {
            let _ = writeln!(out, "  task {task:<20} {n}");
        }

        if let Some(stats) = self.span_length_stats() {
            let _ = writeln!(
                out,
                "\nspans: {} (length min {} / mean {:.1} / max {})",
                stats.count, stats.min, stats.mean, stats.max
            );
            for (reason, n) in &self.close_reasons {
                let _ = writeln!(out, "  closed by {:<10} {n}", reason.as_str());
            }
        }

        let r = &self.retrieval;
        let _ = writeln!(
            out,
            "\nretrieval: {} snapshots, hit rate {:.1}%, {} entries ({} backfilled)",
            r.snapshots,
            r.hit_rate() * 100.0,
            r.entries,
            r.backfilled
        );
        out
    }
}

fn merge_counts<K: Ord>(into: &mut BTreeMap<K, usize>, from: BTreeMap<K, usize>) {
    for (key, n) in from {
        *into.entry(key).or_default() += n;
    }
}
