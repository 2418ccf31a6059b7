//! Rule-based retrieval of historical context for planner samples.
//!
//! Up to `top_k` recent failed or attempted spans of the sample's task are
//! taken first, newest first. Remaining slots are backfilled from the side
//! index by text similarity. The result is frozen into a
//! [`RetrievalSnapshot`] whose id is a hash of its content, so rebuilding
//! with the same corpus and policy reproduces it exactly.

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::history::{HistoryCorpus, SideEntry};
use super::similarity::{metric_for, SimilarityMetric};
use crate::clip::ClipSample;
use crate::config::{HistoryOutcome, RetrievalConfig};
use crate::digest::sha256_hex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalFilters {
    pub outcomes: Vec<HistoryOutcome>,
    pub top_k: usize,
    pub min_similarity: f64,
    pub metric: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    History,
    SideIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedEntry {
    pub id: String,
    pub source: EntrySource,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<HistoryOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    /// Similarity score, for backfilled entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// The historical context selected for one planner sample. Never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSnapshot {
    pub snapshot_id: String,
    pub policy_version: String,
    pub query: RetrievalQuery,
    pub filters: RetrievalFilters,
    pub entries: Vec<RetrievedEntry>,
}

impl RetrievalSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn backfilled(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.source == EntrySource::SideIndex)
            .count()
    }
}

/// Hashed content of a snapshot, everything but the id.
#[derive(Serialize)]
struct SnapshotContent<'a> {
    policy_version: &'a str,
    query: &'a RetrievalQuery,
    filters: &'a RetrievalFilters,
    entries: &'a [RetrievedEntry],
}

pub struct RetrievalConstructor {
    config: RetrievalConfig,
    history: HistoryCorpus,
    side_index: Vec<SideEntry>,
    metric: Box<dyn SimilarityMetric>,
}

impl RetrievalConstructor {
    pub fn new(config: RetrievalConfig, history: HistoryCorpus, side_index: Vec<SideEntry>) -> Self {
        let metric = metric_for(config.metric);
        Self {
            config,
            history,
            side_index,
            metric,
        }
    }

    /// Replace the configured similarity metric.
    pub fn with_metric(mut self, metric: Box<dyn SimilarityMetric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn snapshot(&self, sample: &ClipSample) -> RetrievalSnapshot {
        let query = RetrievalQuery {
            task_id: sample.task_key().map(str::to_string),
            text: query_text(sample),
        };
        let filters = RetrievalFilters {
            outcomes: self.config.include_outcomes.clone(),
            top_k: self.config.top_k,
            min_similarity: self.config.min_similarity,
            metric: self.metric.name().to_string(),
        };

        let mut entries: Vec<RetrievedEntry> = match &query.task_id {
            Some(task) => self
                .history
                .recent(task, &self.config.include_outcomes)
                .take(self.config.top_k)
                .map(|e| RetrievedEntry {
                    id: e.span_id.clone(),
                    source: EntrySource::History,
                    summary: e.summary.clone(),
                    outcome: Some(e.outcome),
                    recorded_at: Some(e.recorded_at),
                    score: None,
                })
                .collect(),
            None => Vec::new(),
        };

        let missing = self.config.top_k.saturating_sub(entries.len());
        if missing > 0 && !query.text.is_empty() {
            entries.extend(self.backfill(&query.text, missing));
        }

        let snapshot_id = snapshot_id(&self.config.policy_version, &query, &filters, &entries);
        RetrievalSnapshot {
            snapshot_id,
            policy_version: self.config.policy_version.clone(),
            query,
            filters,
            entries,
        }
    }

    fn backfill(&self, text: &str, limit: usize) -> Vec<RetrievedEntry> {
        let mut scored: Vec<(OrderedFloat<f64>, &SideEntry)> = self
            .side_index
            .iter()
            .filter_map(|entry| {
                let score = self.metric.score(text, &entry.summary);
                (score > self.config.min_similarity).then_some((OrderedFloat(score), entry))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.entry_id.cmp(&b.1.entry_id)));

        scored
            .into_iter()
            .take(limit)
            .map(|(score, entry)| RetrievedEntry {
                id: entry.entry_id.clone(),
                source: EntrySource::SideIndex,
                summary: entry.summary.clone(),
                outcome: None,
                recorded_at: None,
                score: Some(score.into_inner()),
            })
            .collect()
    }
}

/// Goal, instruction and step text of the sample, de-duplicated.
fn query_text(sample: &ClipSample) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in [
        sample.goal_text(),
        sample.instruct.as_deref(),
        sample.step_text.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        let part = part.trim();
        if !part.is_empty() && !parts.contains(&part) {
            parts.push(part);
        }
    }
    parts.join(" ")
}

fn snapshot_id(
    policy_version: &str,
    query: &RetrievalQuery,
    filters: &RetrievalFilters,
    entries: &[RetrievedEntry],
) -> String {
    let content = SnapshotContent {
        policy_version,
        query,
        filters,
        entries,
    };
    // Serializing plain structs of strings and numbers cannot fail.
    let bytes = serde_json::to_vec(&content).unwrap_or_default();
    let digest = sha256_hex(&bytes);
    format!("snap-{}", &digest[..16])
}
