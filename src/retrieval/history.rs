//! Historical span outcomes and the state-summary side index.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::HistoryOutcome;
use crate::session::loader::read_jsonl;

/// One line of `history.jsonl`: how an earlier span of some task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub span_id: String,
    pub task_id: String,
    pub outcome: HistoryOutcome,
    pub recorded_at: DateTime<Utc>,
    pub summary: String,
}

/// One line of `side_index.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEntry {
    pub entry_id: String,
    pub summary: String,
}

/// History entries grouped by task, most recent first.
#[derive(Debug, Clone, Default)]
pub struct HistoryCorpus {
    by_task: HashMap<String, Vec<HistoryEntry>>,
}

impl HistoryCorpus {
    pub fn new(entries: Vec<HistoryEntry>) -> Self {
        let mut by_task: HashMap<String, Vec<HistoryEntry>> = HashMap::new();
        for entry in entries {
            by_task.entry(entry.task_id.clone()).or_default().push(entry);
        }
        for entries in by_task.values_mut() {
            entries.sort_by(|a, b| {
                b.recorded_at
                    .cmp(&a.recorded_at)
                    .then_with(|| a.span_id.cmp(&b.span_id))
            });
        }
        Self { by_task }
    }

    /// Load `history.jsonl`; no path means an empty corpus.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let entries: Vec<HistoryEntry> = read_jsonl(path)?;
        info!(path = %path.display(), entries = entries.len(), "Loaded history corpus");
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.by_task.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries for `task_id` whose outcome is in `outcomes`, most recent first.
    pub fn recent<'a>(
        &'a self,
        task_id: &str,
        outcomes: &'a [HistoryOutcome],
    ) -> impl Iterator<Item = &'a HistoryEntry> + 'a {
        self.by_task
            .get(task_id)
            .into_iter()
            .flatten()
            .filter(move |e| outcomes.contains(&e.outcome))
    }
}

/// Load `side_index.jsonl`; no path means an empty index.
pub fn load_side_index(path: Option<&Path>) -> Result<Vec<SideEntry>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let entries: Vec<SideEntry> = read_jsonl(path)?;
    info!(path = %path.display(), entries = entries.len(), "Loaded side index");
    Ok(entries)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn entry(span_id: &str, task: &str, outcome: HistoryOutcome, minute: u32) -> HistoryEntry {
        HistoryEntry {
            span_id: span_id.into(),
            task_id: task.into(),
            outcome,
            recorded_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            summary: format!("{span_id} summary"),
        }
    }
}
