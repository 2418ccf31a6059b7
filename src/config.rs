use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::label::types::Uncertainty;

/// Complete configuration for a dataset build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame/action alignment.
    pub aligner: AlignerConfig,
    /// Clip window geometry and QA export.
    pub sampler: SamplerConfig,
    /// Labeling round: batching, retries and the cache key.
    pub labeler: LabelerConfig,
    /// Plan-span truncation.
    pub span: SpanConfig,
    pub retrieval: RetrievalConfig,
    pub assembler: AssemblerConfig,
    /// Remote labeling model.
    pub model: ModelConfig,
}

/// What the aligner drops when a segment has a missing frame or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Drop only the segment containing the gap.
    DropSegment,
    /// Drop the whole episode as soon as one segment has a gap.
    DropEpisode,
}

/// Frame/action alignment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    /// Scope of a drop decision (default: drop the segment).
    pub gap_policy: GapPolicy,
    /// Number of the first frame file; ffmpeg numbers from 1 (default: 1).
    pub frame_index_base: usize,
}

/// Clip window geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Distance between anchors in frames (default: 2, half a second at 2FPS).
    pub anchor_stride: usize,
    /// Length of the near-past / near-future windows (default: 8).
    pub near_window: usize,
    /// Span of the long summary windows in frames (default: 120).
    pub summary_span: usize,
    /// Spacing of summary entries in frames (default: 4).
    pub summary_stride: usize,
    /// Fraction of samples exported as per-sample QA folders (default: 0.0).
    pub export_ratio: f64,
    /// Seed for QA export sampling.
    pub export_seed: u64,
}

/// Components that make up a label cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyPart {
    /// Fingerprint of the encoded frames.
    Media,
    /// Raw goal text at the anchor.
    Goal,
    /// Episode task id, falling back to the segment step id.
    Task,
    SchemaVersion,
    /// Content hash of the loaded vocabularies.
    VocabVersion,
}

/// Labeling round configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelerConfig {
    /// Items per request batch (default: 8).
    pub batch_size: usize,
    /// Attempts per item before it is marked failed (default: 3).
    pub max_attempts: usize,
    /// Delay after each failed attempt, in seconds (default: 1, 2, 4).
    pub backoff_secs: Vec<f64>,
    /// Batches allowed in flight at once (default: 4).
    pub max_in_flight_batches: usize,
    /// Requests allowed in flight at once across all batches (default: 8).
    pub max_concurrent_requests: usize,
    /// Accepted labels at or above this uncertainty are excluded (default: high).
    pub exclude_uncertainty_at_or_above: Option<Uncertainty>,
    /// Which parts make up the cache key.
    pub cache_key: Vec<CacheKeyPart>,
    /// Send the vocabularies with every request (default: true).
    pub include_enums: bool,
    /// Send the label-only lookahead windows (default: true).
    pub include_future_windows: bool,
    /// Frame MIME type used in data URLs.
    pub mime_type: String,
    /// Sampling temperature (default: 0.0).
    pub temperature: f64,
    /// Completion token limit per request (default: 2048).
    pub max_tokens: usize,
    /// Per-request timeout in seconds (default: 120).
    pub timeout_secs: u64,
    /// Overrides the built-in system prompt when set.
    pub system_prompt: Option<String>,
}

/// Plan-span truncation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanConfig {
    /// Consecutive frames with the same evidence needed to close a span (default: 3).
    pub stable_frames: usize,
    /// Minimum evidence confidence counted towards stability (default: 0.8).
    pub min_evidence_confidence: f64,
    /// Confidence attributed to each labeler uncertainty level.
    pub uncertainty_confidence: BTreeMap<Uncertainty, f64>,
    /// Event classes that force a span to close.
    pub strong_interrupts: Vec<String>,
    /// Frames of history attached to each controller record (default: 7).
    pub history_frames: usize,
}

/// Which historical outcomes the retrieval constructor may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOutcome {
    Failed,
    Attempted,
    Succeeded,
}

/// Similarity metric used to backfill from the side index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityKind {
    TokenJaccard,
    Cosine,
}

/// Retrieval field configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of entries per snapshot (default: 5).
    pub top_k: usize,
    /// Version string stamped on every snapshot.
    pub policy_version: String,
    /// Outcomes eligible for the recency lookup (default: failed, attempted).
    pub include_outcomes: Vec<HistoryOutcome>,
    /// Backfill entries must score strictly above this (default: 0.0).
    pub min_similarity: f64,
    /// Backfill scoring (default: token Jaccard).
    pub metric: SimilarityKind,
}

/// Output stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Version tag stamped on every output record.
    pub schema_version: String,
    /// Skip planner samples whose snapshot came back empty (default: false).
    pub require_retrieval_hits: bool,
}

/// Labeling model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible API.
    pub api_base: String,
    /// Vision-language model identifier.
    pub model_id: String,
    /// API key; filled from the environment when empty.
    pub api_key: String,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            gap_policy: GapPolicy::DropSegment,
            frame_index_base: 1,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            anchor_stride: 2,
            near_window: 8,
            summary_span: 120,
            summary_stride: 4,
            export_ratio: 0.0,
            export_seed: 0,
        }
    }
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            max_attempts: 3,
            backoff_secs: vec![1.0, 2.0, 4.0],
            max_in_flight_batches: 4,
            max_concurrent_requests: 8,
            exclude_uncertainty_at_or_above: Some(Uncertainty::High),
            cache_key: vec![
                CacheKeyPart::Media,
                CacheKeyPart::Goal,
                CacheKeyPart::Task,
                CacheKeyPart::SchemaVersion,
            ],
            include_enums: true,
            include_future_windows: true,
            mime_type: "image/jpeg".into(),
            temperature: 0.0,
            max_tokens: 2048,
            timeout_secs: 120,
            system_prompt: None,
        }
    }
}

impl Default for SpanConfig {
    fn default() -> Self {
        Self {
            stable_frames: 3,
            min_evidence_confidence: 0.8,
            uncertainty_confidence: BTreeMap::from([
                (Uncertainty::Low, 0.9),
                (Uncertainty::Mid, 0.6),
                (Uncertainty::High, 0.3),
            ]),
            strong_interrupts: Vec::new(),
            history_frames: 7,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            policy_version: "recency-v1".into(),
            include_outcomes: vec![HistoryOutcome::Failed, HistoryOutcome::Attempted],
            min_similarity: 0.0,
            metric: SimilarityKind::TokenJaccard,
        }
    }
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            schema_version: "clipforge.v1".into(),
            require_retrieval_hits: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/v1".into(),
            model_id: "Qwen/Qwen2.5-VL-7B-Instruct".into(),
            api_key: String::new(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aligner: AlignerConfig::default(),
            sampler: SamplerConfig::default(),
            labeler: LabelerConfig::default(),
            span: SpanConfig::default(),
            retrieval: RetrievalConfig::default(),
            assembler: AssemblerConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON configuration file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }
}

impl LabelerConfig {
    /// Backoff delay after the `attempt`-th failure (1-based).
    ///
    /// Attempts past the end of the schedule reuse its last entry.
    pub fn backoff_after(&self, attempt: usize) -> std::time::Duration {
        let secs = self
            .backoff_secs
            .get(attempt.saturating_sub(1))
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(0.0);
        std::time::Duration::from_secs_f64(secs.max(0.0))
    }
}
